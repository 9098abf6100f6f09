//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every backend's health endpoint
//! - Update backend liveness based on results

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;

use crate::config::validation::MAX_INTERVAL_SECS;
use crate::config::HealthCheckConfig;
use crate::lifecycle::ShutdownSignal;
use crate::load_balancer::{Backend, BackendPool};
use crate::observability::metrics;

/// Something that fires once per health-check round.
pub trait TickSource: Send {
    fn tick(&mut self) -> impl Future<Output = ()> + Send;
}

impl TickSource for time::Interval {
    fn tick(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            time::Interval::tick(self).await;
        }
    }
}

/// Manual trigger; a closed channel never fires again.
impl TickSource for mpsc::Receiver<()> {
    fn tick(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            if self.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Status(StatusCode),
    Error(String),
    Timeout,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

pub struct HealthMonitor {
    pool: Arc<BackendPool>,
    config: HealthCheckConfig,
    client: Client<HttpConnector, Body>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<BackendPool>, config: HealthCheckConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self { pool, config, client }
    }

    /// Run on the configured interval until shutdown.
    pub async fn run(self, shutdown: ShutdownSignal) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        let interval = self.config.interval_secs.clamp(1, MAX_INTERVAL_SECS);
        let mut ticker = time::interval(Duration::from_secs(interval));
        // First tick completes immediately; probe one interval after startup.
        ticker.reset();
        self.run_with(ticker, shutdown).await;
    }

    /// Run one round per tick until shutdown.
    ///
    /// A round interrupted by shutdown is dropped, which aborts its probe tasks.
    pub async fn run_with<T: TickSource>(&self, mut ticks: T, mut shutdown: ShutdownSignal) {
        tracing::info!(
            interval = self.config.interval_secs,
            path = %self.config.path,
            backends = self.pool.len(),
            "Health monitor starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
                _ = async {
                    ticks.tick().await;
                    self.check_all().await;
                } => {}
            }
        }
    }

    /// Probe every backend concurrently and apply the results.
    pub async fn check_all(&self) {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut probes = JoinSet::new();

        for backend in self.pool.snapshot() {
            let client = self.client.clone();
            let url = backend.health_url(&self.config.path);
            probes.spawn(async move {
                let outcome = probe(&client, &url, timeout).await;
                apply(&backend, &outcome);
                outcome
            });
        }

        while let Some(joined) = probes.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Health probe task failed");
            }
        }
    }
}

async fn probe(client: &Client<HttpConnector, Body>, url: &str, timeout: Duration) -> ProbeOutcome {
    let request = match Request::get(url)
        .header("user-agent", "gatekeeper-health-check")
        .body(Body::empty())
    {
        Ok(req) => req,
        Err(e) => return ProbeOutcome::Error(e.to_string()),
    };

    match time::timeout(timeout, client.request(request)).await {
        Ok(Ok(response)) if response.status() == StatusCode::OK => ProbeOutcome::Healthy,
        Ok(Ok(response)) => ProbeOutcome::Status(response.status()),
        Ok(Err(e)) => ProbeOutcome::Error(e.to_string()),
        Err(_) => ProbeOutcome::Timeout,
    }
}

fn apply(backend: &Backend, outcome: &ProbeOutcome) {
    let was_alive = backend.is_alive();
    let healthy = outcome.is_healthy();
    backend.set_alive(healthy);
    metrics::record_backend_health(backend.label(), healthy);

    match outcome {
        ProbeOutcome::Healthy if !was_alive => {
            tracing::info!(backend = %backend.label(), "Server is reachable again");
        }
        ProbeOutcome::Healthy => {
            tracing::debug!(backend = %backend.label(), "Server is reachable");
        }
        ProbeOutcome::Status(status) => {
            tracing::warn!(backend = %backend.label(), status = %status, "Server is unreachable: non-200 health status");
        }
        ProbeOutcome::Error(e) => {
            tracing::warn!(backend = %backend.label(), error = %e, "Server is unreachable: connection error");
        }
        ProbeOutcome::Timeout => {
            tracing::warn!(backend = %backend.label(), "Server is unreachable: timeout");
        }
    }
}
