//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the Axum router: proxied catch-all behind admission control,
//!   admin and metrics endpoints outside it
//! - Wire up cross-cutting layers (timeout, request ID, tracing)
//! - Own the background tasks (health monitor, refill worker) for the
//!   lifetime of the listener
//! - Drain in-flight requests on shutdown within the grace period

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;
use tokio::time;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin::admin_router;
use crate::config::ProxyConfig;
use crate::health::HealthMonitor;
use crate::http::middleware::admission_middleware;
use crate::lifecycle::{Shutdown, StartupError};
use crate::load_balancer::{BackendPool, Balancer, ForwardOptions};
use crate::observability::metrics;
use crate::rate_limit::{BucketStore, TokenBucketLimiter};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Shared state injected into handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    balancer: Arc<Balancer>,
    limiter: Option<Arc<TokenBucketLimiter>>,
    salt: Arc<str>,
}

impl AppState {
    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    /// `None` when rate limiting is disabled.
    pub fn limiter(&self) -> Option<&TokenBucketLimiter> {
        self.limiter.as_deref()
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }
}

/// HTTP server for the load balancer.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    pool: Arc<BackendPool>,
    limiter: Option<Arc<TokenBucketLimiter>>,
}

impl HttpServer {
    /// Build the server. Fails on a malformed backend URL.
    pub fn new(config: ProxyConfig, store: Arc<dyn BucketStore>) -> Result<Self, StartupError> {
        let pool = Arc::new(BackendPool::from_urls(
            &config.backends,
            ForwardOptions::from_config(&config),
        )?);
        let balancer = Arc::new(Balancer::new(pool.clone(), config.limits.max_body_size));

        let limiter = if config.rate_limit.enabled {
            Some(Arc::new(TokenBucketLimiter::new(store, &config.rate_limit)))
        } else {
            tracing::warn!("Rate limiting disabled, all requests are admitted");
            None
        };

        if config.observability.metrics_enabled {
            metrics::init_metrics();
        }

        let state = AppState {
            balancer,
            limiter: limiter.clone(),
            salt: Arc::from(config.rate_limit.salt.as_str()),
        };

        let router = Self::build_router(&config, state);
        Ok(Self {
            router,
            config,
            pool,
            limiter,
        })
    }

    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        let proxied = Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .route_layer(middleware::from_fn_with_state(state.clone(), admission_middleware));

        let mut router = Router::new()
            .route("/favicon.ico", get(favicon))
            .merge(admin_router())
            .merge(proxied);

        if config.observability.metrics_enabled {
            router = router.route("/metrics", get(metrics_handler));
        }

        router
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }))
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Router with every layer applied; serve it or drive it with `oneshot`.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn limiter(&self) -> Option<&Arc<TokenBucketLimiter>> {
        self.limiter.as_ref()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serve until `shutdown` fires, then drain for at most `shutdown_grace_secs`.
    ///
    /// A shutdown triggered before or during startup is honoured: every task
    /// takes its signal before the first await.
    pub async fn run(self, listener: TcpListener, shutdown: &Shutdown) -> Result<(), StartupError> {
        let addr = listener.local_addr()?;
        let mut stop = shutdown.subscribe();
        let serve_stop = shutdown.signalled();
        let refill_stop = shutdown.subscribe();

        let health = tokio::spawn(
            HealthMonitor::new(self.pool.clone(), self.config.health_check.clone()).run(shutdown.subscribe()),
        );

        let refills = match &self.limiter {
            Some(limiter) => {
                if let Err(e) = limiter.restore().await {
                    health.abort();
                    return Err(e.into());
                }
                Some(limiter.spawn_refills(refill_stop))
            }
            None => None,
        };

        tracing::info!(
            address = %addr,
            backends = self.pool.len(),
            rate_limit = self.limiter.is_some(),
            "Load balancer listening"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let mut server = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(serve_stop)
                .into_future(),
        );

        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);
        let outcome = tokio::select! {
            joined = &mut server => joined,
            _ = stop.recv() => {
                tracing::info!(grace_secs = grace.as_secs(), "Draining in-flight requests");
                match time::timeout(grace, &mut server).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!("Grace period elapsed, dropping remaining connections");
                        server.abort();
                        Ok(Ok(()))
                    }
                }
            }
        };

        // The server may have stopped on its own; make sure background tasks follow.
        shutdown.trigger();
        if let Some(limiter) = &self.limiter {
            limiter.stop_all();
        }
        if let Err(e) = health.await {
            tracing::error!(error = %e, "Health monitor task failed");
        }
        if let Some(refills) = refills {
            if let Err(e) = refills.await {
                tracing::error!(error = %e, "Refill worker task failed");
            }
        }

        match outcome {
            Ok(Ok(())) => {
                tracing::info!("HTTP server stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(StartupError::Serve(e)),
            Err(e) => Err(StartupError::Serve(std::io::Error::other(e.to_string()))),
        }
    }
}

async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    state.balancer().serve(request).await
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn favicon() -> StatusCode {
    StatusCode::OK
}
