//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_requests_total{method,path,status}` (counter): admitted requests
//! - `http_request_duration_seconds{path}` (histogram): latency through the proxy
//! - `active_connections` (gauge): requests currently inside the admission layer
//! - `proxied_requests_total{backend}` / `proxied_failures_total{backend}` (counters)
//! - `backend_response_status{backend,status}` (counter)
//! - `backend_active_connections{backend}` (gauge)
//! - `backend_health{backend}` (gauge): 1 alive, 0 dead
//! - `rate_limited_total` (counter): requests rejected with 429
//!
//! All recording goes through the `metrics` facade; the Prometheus recorder
//! is installed once per process and rendered by `GET /metrics`.

use std::sync::OnceLock;
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the one already installed.
///
/// If another global recorder is already set, a detached recorder is used so
/// `/metrics` still renders (empty) instead of failing startup.
pub fn init_metrics() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let builder = match builder
                .set_buckets_for_metric(Matcher::Full("http_request_duration_seconds".to_string()), LATENCY_BUCKETS)
            {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid latency buckets, using summaries");
                    PrometheusBuilder::new()
                }
            };

            match builder.install_recorder() {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics recorder already installed elsewhere");
                    PrometheusBuilder::new().build_recorder().handle()
                }
            }
        })
        .clone()
}

/// Prometheus text exposition of everything recorded so far.
pub fn render() -> String {
    init_metrics().render()
}

pub fn record_request(method: &str, path: &str, status: u16, start: Instant) {
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("http_request_duration_seconds", "path" => path.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited() {
    metrics::counter!("rate_limited_total").increment(1);
}

pub fn record_proxied(backend: &str) {
    metrics::counter!("proxied_requests_total", "backend" => backend.to_string()).increment(1);
}

pub fn record_proxied_failure(backend: &str) {
    metrics::counter!("proxied_failures_total", "backend" => backend.to_string()).increment(1);
}

pub fn record_backend_status(backend: &str, status: u16) {
    metrics::counter!(
        "backend_response_status",
        "backend" => backend.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_backend_connections(backend: &str, count: i64) {
    metrics::gauge!("backend_active_connections", "backend" => backend.to_string()).set(count as f64);
}

pub fn record_backend_health(backend: &str, healthy: bool) {
    metrics::gauge!("backend_health", "backend" => backend.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

/// Holds `active_connections` up for as long as it lives.
#[derive(Debug)]
pub struct ActiveRequestGuard(());

impl ActiveRequestGuard {
    pub fn new() -> Self {
        metrics::gauge!("active_connections").increment(1.0);
        Self(())
    }
}

impl Default for ActiveRequestGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        metrics::gauge!("active_connections").decrement(1.0);
    }
}
