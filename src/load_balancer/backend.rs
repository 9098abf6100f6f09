//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream server bound to one URL
//! - Track active connections (for Least Connections LB)
//! - Track liveness (set by health checks and failed forwards)
//! - Forward requests and buffer the upstream response

use std::net::IpAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, Version};
use axum::response::IntoResponse;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::time;
use url::Url;

use crate::config::ProxyConfig;
use crate::http::response::{messages, ApiResponse};
use crate::observability::metrics;

/// Error type for backend construction and request rewriting.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("cannot build upstream URI: {0}")]
    Uri(String),
}

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Parse and check a backend URL without building a backend.
pub fn parse_backend_url(raw: &str) -> Result<Url, BackendError> {
    let invalid = |reason: String| BackendError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "http" {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Per-attempt forwarding limits shared by every backend.
#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions {
    /// Deadline for one upstream exchange, body included.
    pub timeout: Duration,
    /// Largest upstream body buffered before it is committed to the client.
    pub max_response_size: usize,
}

impl ForwardOptions {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeouts.upstream_secs),
            max_response_size: config.limits.max_response_size,
        }
    }
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_response_size: 16 * 1024 * 1024,
        }
    }
}

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    /// URL without trailing slash, used in logs and metric labels.
    label: String,
    client: Client<HttpConnector, Body>,
    options: ForwardOptions,
    alive: RwLock<bool>,
    active_connections: AtomicI64,
}

impl Backend {
    /// Create a new backend. Malformed URLs are logged and returned as errors.
    pub fn new(raw_url: &str, options: ForwardOptions) -> Result<Self, BackendError> {
        let url = parse_backend_url(raw_url).inspect_err(|e| {
            tracing::error!(url = %raw_url, error = %e, "Invalid backend URL");
        })?;
        let label = url.as_str().trim_end_matches('/').to_string();

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            url,
            label,
            client,
            options,
            alive: RwLock::new(true),
            active_connections: AtomicI64::new(0),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Stable textual identity of the backend.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Get the current number of active connections.
    pub fn connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Increment active connection count.
    pub fn add_connection(&self) {
        let now = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_backend_connections(&self.label, now);
    }

    /// Decrement active connection count.
    pub fn remove_connection(&self) {
        let now = self.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::record_backend_connections(&self.label, now);
    }

    /// Count one in-flight request until the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> BackendConnectionGuard {
        self.add_connection();
        BackendConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_alive(&self, alive: bool) {
        *self.alive.write().unwrap_or_else(PoisonError::into_inner) = alive;
    }

    /// Absolute URL of the health endpoint under this backend's base path.
    ///
    /// The backend's own query string is not carried over; a query in `path` is.
    pub fn health_url(&self, path: &str) -> String {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };
        let mut url = self.url.clone();
        let base = self.url.path().trim_end_matches('/');
        url.set_path(&format!("{base}{path}"));
        url.set_query(query);
        url.into()
    }

    /// Rewrite an inbound URI onto this backend: base path joined with the
    /// request path, backend query first then request query.
    pub fn target_uri(&self, uri: &Uri) -> Result<Uri, BackendError> {
        let mut target = self.url.clone();

        let base = self.url.path().trim_end_matches('/');
        let path = match uri.path() {
            "" => "/",
            p => p,
        };
        target.set_path(&format!("{base}{path}"));

        let query = match (self.url.query(), uri.query()) {
            (Some(a), Some(b)) if !a.is_empty() => Some(format!("{a}&{b}")),
            (a, b) => b.or(a).map(str::to_string),
        };
        target.set_query(query.as_deref());

        Uri::try_from(target.as_str()).map_err(|e| BackendError::Uri(e.to_string()))
    }

    /// Forward a request and buffer the full response.
    ///
    /// Transport failures, timeouts and unreadable bodies never surface as
    /// errors: they become a `502` envelope so the caller can classify every
    /// outcome by status alone.
    pub async fn forward(&self, request: Request<Body>, client_ip: Option<IpAddr>) -> Response<Body> {
        let (mut parts, body) = request.into_parts();

        parts.uri = match self.target_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(backend = %self.label, error = %e, "Failed to rewrite request URI");
                return proxy_error_response();
            }
        };
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        if let Some(ip) = client_ip {
            append_forwarded_for(&mut parts.headers, ip);
        }

        let request = Request::from_parts(parts, body);
        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| e.to_string())?;
            let (mut parts, body) = response.into_parts();
            let bytes = axum::body::to_bytes(Body::new(body), self.options.max_response_size)
                .await
                .map_err(|e| e.to_string())?;
            strip_hop_by_hop(&mut parts.headers);
            Ok::<_, String>(Response::from_parts(parts, Body::from(bytes)))
        };

        match time::timeout(self.options.timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(backend = %self.label, error = %e, "Proxy error");
                proxy_error_response()
            }
            Err(_) => {
                tracing::error!(
                    backend = %self.label,
                    timeout = ?self.options.timeout,
                    "Proxy error: upstream timed out"
                );
                proxy_error_response()
            }
        }
    }
}

fn proxy_error_response() -> Response<Body> {
    ApiResponse::error(StatusCode::BAD_GATEWAY, messages::PROXY_ERROR).into_response()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert("x-forwarded-for", value);
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.remove_connection();
    }
}
