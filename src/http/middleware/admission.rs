//! Admission control in front of the balancer.
//!
//! Identifies the client, charges one token from its bucket and either lets
//! the request through or answers 429 itself. A store failure is a 500, never
//! a silent allow.
//!
//! Requests whose address cannot be resolved (no forwarding headers and no
//! peer address) all share one bucket keyed on `unknown`.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::http::response::{error_response, messages};
use crate::http::server::AppState;
use crate::observability::metrics::{self, ActiveRequestGuard};
use crate::rate_limit::{LimiterError, TokenBucketLimiter};
use crate::security::{client_ip, hash_client_key};

/// Bucket identity for requests with no resolvable client address.
pub const UNKNOWN_CLIENT: &str = "unknown";

pub async fn admission_middleware(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let _active = ActiveRequestGuard::new();
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = match state.limiter() {
        Some(limiter) => {
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            let ip = match client_ip(request.headers(), peer) {
                Some(ip) => ip.to_string(),
                None => {
                    tracing::debug!(path = %path, "Client address unresolved, using shared bucket");
                    UNKNOWN_CLIENT.to_string()
                }
            };
            let key = hash_client_key(&ip, state.salt());

            match admit(limiter, &key).await {
                Ok(remaining) => {
                    tracing::debug!(client = %key, remaining, "Admitted request");
                    next.run(request).await
                }
                Err(LimiterError::NoTokens) => {
                    tracing::warn!(client = %key, path = %path, "Rate limit exceeded");
                    metrics::record_rate_limited();
                    error_response(StatusCode::TOO_MANY_REQUESTS, messages::TOO_MANY_REQUESTS)
                }
                Err(e) => {
                    tracing::error!(client = %key, error = %e, "Rate limiter failed");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, messages::LIMITER_FAILED)
                }
            }
        }
        None => next.run(request).await,
    };

    metrics::record_request(&method, &path, response.status().as_u16(), start);
    response
}

/// Charge one token, registering the client on first sight.
async fn admit(limiter: &TokenBucketLimiter, key: &str) -> Result<i64, LimiterError> {
    match limiter.get_tokens(key).await {
        Ok(_) => {}
        Err(LimiterError::NotFound(_)) => limiter.add_user(key).await?,
        Err(e) => return Err(e),
    }

    match limiter.remove_token(key).await {
        // Bucket vanished between the lookup and the take; recreate it once.
        Err(LimiterError::NotFound(_)) => {
            limiter.add_user(key).await?;
            limiter.remove_token(key).await
        }
        other => other,
    }
}
