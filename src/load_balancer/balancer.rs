//! Request dispatch with bounded failover.
//!
//! # Responsibilities
//! - Pick a backend per attempt through the configured strategy
//! - Forward into a buffered response and classify its status
//! - Commit 2xx-4xx, fail over on 5xx, give up after one try per backend
//!
//! # Design Decisions
//! - Attempts are sequential and bounded by pool size (no retry storms)
//! - A failing backend is marked dead immediately, which also steers concurrent requests away
//! - The connection guard lives for one attempt only, so counts never inflate across retries
//! - 4xx is the client's fault, never a reason to fail over

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::{request::Parts, Request, StatusCode};
use axum::response::Response;

use crate::http::response::{error_response, messages};
use crate::load_balancer::{least_conn::LeastConnections, pool::BackendPool, LoadBalancer};
use crate::observability::metrics;

/// Statuses committed to the client without failover.
pub fn is_success_band(status: StatusCode) -> bool {
    (200..500).contains(&status.as_u16())
}

/// Owns the pool and the selection strategy.
#[derive(Debug)]
pub struct Balancer {
    pool: Arc<BackendPool>,
    strategy: Box<dyn LoadBalancer>,
    max_body_size: usize,
}

impl Balancer {
    /// Least-connections balancer over `pool`.
    pub fn new(pool: Arc<BackendPool>, max_body_size: usize) -> Self {
        Self::with_strategy(pool, Box::new(LeastConnections::new()), max_body_size)
    }

    pub fn with_strategy(pool: Arc<BackendPool>, strategy: Box<dyn LoadBalancer>, max_body_size: usize) -> Self {
        Self {
            pool,
            strategy,
            max_body_size,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Serve one request, failing over across backends as needed.
    pub async fn serve(&self, request: Request<Body>) -> Response {
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, self.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %parts.uri.path(), error = %e, "Failed to buffer request body");
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, messages::BODY_TOO_LARGE);
            }
        };

        let max_attempts = self.pool.len().max(1);
        for attempt in 1..=max_attempts {
            let backends = self.pool.snapshot();
            let Some(backend) = self.strategy.next_server(&backends) else {
                if attempt == 1 {
                    tracing::error!(path = %parts.uri.path(), "No backends are reachable");
                    return error_response(StatusCode::SERVICE_UNAVAILABLE, messages::NO_BACKENDS);
                }
                tracing::error!(attempt, "No backends left to fail over to");
                break;
            };

            let response = {
                let guard = backend.track();
                metrics::record_proxied(guard.label());
                tracing::info!(
                    backend = %guard.label(),
                    active = guard.connections(),
                    attempt,
                    "Forwarding request"
                );
                guard.forward(attempt_request(&parts, &body), client_ip).await
            };

            let status = response.status();
            metrics::record_backend_status(backend.label(), status.as_u16());

            if is_success_band(status) {
                tracing::info!(backend = %backend.label(), status = status.as_u16(), "Successfully proxied");
                return response;
            }

            metrics::record_proxied_failure(backend.label());
            tracing::error!(
                backend = %backend.label(),
                attempt,
                status = status.as_u16(),
                reason = status.canonical_reason().unwrap_or("unknown"),
                uri = %parts.uri,
                "Attempt failed"
            );
            backend.set_alive(false);
        }

        tracing::error!(path = %parts.uri.path(), "All attempts failed");
        error_response(StatusCode::SERVICE_UNAVAILABLE, messages::SERVICE_UNAVAILABLE)
    }
}

/// Fresh copy of the inbound request for one attempt.
fn attempt_request(parts: &Parts, body: &Bytes) -> Request<Body> {
    let mut request = Request::new(Body::from(body.clone()));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    request
}
