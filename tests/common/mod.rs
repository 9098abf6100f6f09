//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceExt;

use gatekeeper::config::{ProxyConfig, StoreKind};

#[derive(Debug)]
struct MockState {
    status: AtomicU16,
    health: AtomicU16,
    hits: AtomicUsize,
    delay_ms: AtomicU64,
}

/// Programmable backend on an ephemeral port.
///
/// `/health` answers with the health status and is not counted; every other
/// path answers with the response status and echoes `path?query|body`,
/// after the configured delay.
#[derive(Debug, Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start(status: u16) -> Self {
        let state = Arc::new(MockState {
            status: AtomicU16::new(status),
            health: AtomicU16::new(200),
            hits: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        });

        let app = Router::new()
            .route("/health", get(health))
            .fallback(echo)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }

    pub fn set_health(&self, status: u16) {
        self.state.health.store(status, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

async fn health(State(state): State<Arc<MockState>>) -> StatusCode {
    StatusCode::from_u16(state.health.load(Ordering::SeqCst)).unwrap()
}

async fn echo(State(state): State<Arc<MockState>>, uri: Uri, body: Bytes) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let status = StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap();
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let body = format!("{}|{}", path, String::from_utf8_lossy(&body));
    (status, body).into_response()
}

/// URL of a port nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// In-memory store, no health loop, generous limits.
pub fn test_config(backends: Vec<String>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.backends = backends;
    config.health_check.enabled = false;
    config.rate_limit.store = StoreKind::Memory;
    config.rate_limit.salt = "test-salt".to_string();
    config.timeouts.upstream_secs = 5;
    config
}

/// Request as if it arrived over a connection from `peer`.
pub fn request(method: &str, uri: &str, peer: &str, body: impl Into<Body>) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap();
    let addr: SocketAddr = format!("{peer}:40000").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

pub async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
