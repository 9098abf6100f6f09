//! Rate limiting, admin endpoints and metrics through the full router.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{body_string, request, send, test_config, MockBackend};
use gatekeeper::http::middleware::admission::UNKNOWN_CLIENT;
use gatekeeper::http::ApiResponse;
use gatekeeper::rate_limit::{
    Bucket, BucketSettings, BucketStore, MemoryStore, StoreError, TakeOutcome,
};
use gatekeeper::security::hash_client_key;
use gatekeeper::{HttpServer, Shutdown};
use tokio::time::{self, Instant};

const SALT: &str = "test-salt";

fn server_with(store: Arc<dyn BucketStore>, backend: &MockBackend, max: i64, rate: u64) -> HttpServer {
    let mut config = test_config(vec![backend.url()]);
    config.rate_limit.default_max_tokens = max;
    config.rate_limit.default_rate_secs = rate;
    HttpServer::new(config, store).unwrap()
}

async fn burst(server: &HttpServer, peer: &str, n: usize) -> (usize, usize) {
    let router = server.router();
    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..n {
        match send(&router, request("GET", "/", peer, "")).await.status() {
            StatusCode::OK => ok += 1,
            StatusCode::TOO_MANY_REQUESTS => limited += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    (ok, limited)
}

#[tokio::test]
async fn first_request_uses_seed_token() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 10, 60);

    assert_eq!(burst(&server, "10.0.0.1", 2).await, (1, 1));
    assert_eq!(backend.hits(), 1);

    let key = hash_client_key("10.0.0.1", SALT);
    let limiter = server.limiter().unwrap();
    assert_eq!(limiter.get_tokens(&key).await.unwrap(), 0);
    assert_eq!(limiter.get_max_tokens(&key).await.unwrap(), 10);
}

#[tokio::test]
async fn full_bucket_admits_capacity_then_refills() {
    let backend = MockBackend::start(200).await;
    let store = Arc::new(MemoryStore::new());
    let key = hash_client_key("10.0.0.7", SALT);
    store
        .insert_if_absent(&key, Bucket { rate: 1, max_tokens: 3, current: 3 })
        .await
        .unwrap();

    let server = server_with(store, &backend, 3, 1);
    let limiter = server.limiter().unwrap();
    let shutdown = Shutdown::new();
    let restored_at = Instant::now();
    assert_eq!(limiter.restore().await.unwrap(), 1);
    limiter.spawn_refills(shutdown.subscribe());

    assert_eq!(burst(&server, "10.0.0.7", 5).await, (3, 2));
    assert_eq!(backend.hits(), 3);

    // Refills land at +1s and +2s after restore.
    time::sleep_until(restored_at + Duration::from_millis(2500)).await;
    assert_eq!(burst(&server, "10.0.0.7", 5).await, (2, 3));
    limiter.stop_all();
}

#[tokio::test]
async fn clients_are_limited_independently() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 5, 60);
    let router = server.router();

    assert_eq!(burst(&server, "10.0.0.1", 2).await, (1, 1));

    let mut forwarded = request("GET", "/", "10.0.0.1", "");
    forwarded
        .headers_mut()
        .insert("x-forwarded-for", "192.168.1.50, 10.0.0.1".parse().unwrap());
    assert_eq!(send(&router, forwarded).await.status(), StatusCode::OK);

    let mut real_ip = request("GET", "/", "10.0.0.1", "");
    real_ip.headers_mut().insert("x-real-ip", "172.16.0.4".parse().unwrap());
    assert_eq!(send(&router, real_ip).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn unresolved_clients_share_one_bucket() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 10, 60);
    let router = server.router();

    let anonymous = || Request::builder().uri("/").body(Body::empty()).unwrap();
    assert_eq!(send(&router, anonymous()).await.status(), StatusCode::OK);
    assert_eq!(send(&router, anonymous()).await.status(), StatusCode::TOO_MANY_REQUESTS);

    let limiter = server.limiter().unwrap();
    let shared = hash_client_key(UNKNOWN_CLIENT, SALT);
    assert_eq!(limiter.get_tokens(&shared).await.unwrap(), 0);

    // Resolvable clients keep their own buckets.
    assert_eq!(burst(&server, "10.0.0.9", 1).await, (1, 0));
}

#[tokio::test]
async fn rejection_uses_envelope() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 1, 60);
    let router = server.router();

    send(&router, request("GET", "/", "10.0.0.1", "")).await;
    let response = send(&router, request("GET", "/", "10.0.0.1", "")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let envelope: ApiResponse = serde_json::from_str(&body_string(response).await).unwrap();
    assert!(!envelope.success);
    assert_eq!(envelope.code, 429);
}

#[tokio::test]
async fn disabled_rate_limit_admits_everything() {
    let backend = MockBackend::start(200).await;
    let mut config = test_config(vec![backend.url()]);
    config.rate_limit.enabled = false;
    let server = HttpServer::new(config, Arc::new(MemoryStore::new())).unwrap();

    assert_eq!(burst(&server, "10.0.0.1", 20).await, (20, 0));
}

#[tokio::test]
async fn favicon_is_not_limited_or_proxied() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 1, 60);
    let router = server.router();

    for _ in 0..5 {
        let response = send(&router, request("GET", "/favicon.ico", "10.0.0.1", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn set_max_and_set_rate_update_known_clients() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 10, 60);
    let router = server.router();
    let key = hash_client_key("10.0.0.1", SALT);

    let response = send(&router, request("GET", "/set_max?ip=10.0.0.1&value=5", "127.0.0.1", "")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    send(&router, request("GET", "/", "10.0.0.1", "")).await;

    let response = send(&router, request("GET", "/set_max?ip=10.0.0.1&value=5", "127.0.0.1", "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let envelope: ApiResponse = serde_json::from_str(&body_string(response).await).unwrap();
    assert!(envelope.success);

    let uri = format!("/set_rate?ip={key}&value=3");
    let response = send(&router, request("POST", &uri, "127.0.0.1", "")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let limiter = server.limiter().unwrap();
    assert_eq!(limiter.get_max_tokens(&key).await.unwrap(), 5);
    assert_eq!(limiter.get_rate(&key).await.unwrap(), 3);
    assert_eq!(limiter.scheduler().period(&key), Some(Duration::from_secs(3)));
    limiter.stop_all();
}

#[tokio::test]
async fn admin_rejects_bad_parameters() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 10, 60);
    let router = server.router();
    send(&router, request("GET", "/", "10.0.0.1", "")).await;

    for uri in [
        "/set_rate?ip=10.0.0.1",
        "/set_rate?value=3",
        "/set_rate?ip=10.0.0.1&value=abc",
        "/set_rate?ip=10.0.0.1&value=0",
        "/set_max?ip=10.0.0.1&value=-2",
    ] {
        let response = send(&router, request("GET", uri, "127.0.0.1", "")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn admin_refuses_rates_beyond_a_year() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 10, 60);
    let router = server.router();
    let key = hash_client_key("10.0.0.1", SALT);
    send(&router, request("GET", "/", "10.0.0.1", "")).await;

    for uri in [
        "/set_rate?ip=10.0.0.1&value=9223372036854775807",
        "/set_rate?ip=10.0.0.1&value=31536001",
    ] {
        let response = send(&router, request("POST", uri, "127.0.0.1", "")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }

    let limiter = server.limiter().unwrap();
    assert_eq!(limiter.get_rate(&key).await.unwrap(), 60);

    // The proxy keeps serving after the rejected updates.
    let response = send(&router, request("GET", "/set_rate?ip=10.0.0.1&value=31536000", "127.0.0.1", "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(send(&router, request("GET", "/", "10.0.0.2", "")).await.status(), StatusCode::OK);
    limiter.stop_all();
}

#[tokio::test]
async fn metrics_endpoint_exposes_counters() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 1, 60);
    let router = server.router();

    burst(&server, "10.0.0.1", 3).await;

    let response = send(&router, request("GET", "/metrics", "127.0.0.1", "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let text = body_string(response).await;
    assert!(text.contains("rate_limited_total"));
    assert!(text.contains("http_requests_total"));
    assert!(text.contains("proxied_requests_total"));
}

#[tokio::test]
async fn responses_carry_request_id() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(MemoryStore::new()), &backend, 10, 60);

    let response = send(&server.router(), request("GET", "/", "10.0.0.1", "")).await;
    assert!(response.headers().contains_key("x-request-id"));
}

/// Store that is always down.
struct FailingStore;

#[async_trait]
impl BucketStore for FailingStore {
    async fn find(&self, _key: &str) -> Result<Option<Bucket>, StoreError> {
        Err(StoreError::Unavailable("down".to_string()))
    }

    async fn insert_if_absent(&self, _key: &str, _bucket: Bucket) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("down".to_string()))
    }

    async fn take_token(&self, _key: &str) -> Result<TakeOutcome, StoreError> {
        Err(StoreError::Unavailable("down".to_string()))
    }

    async fn refill(&self, _key: &str) -> Result<Option<Bucket>, StoreError> {
        Err(StoreError::Unavailable("down".to_string()))
    }

    async fn update(&self, _key: &str, _settings: BucketSettings) -> Result<Option<Bucket>, StoreError> {
        Err(StoreError::Unavailable("down".to_string()))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("down".to_string()))
    }
}

#[tokio::test]
async fn store_outage_is_a_server_error_not_an_allow() {
    let backend = MockBackend::start(200).await;
    let server = server_with(Arc::new(FailingStore), &backend, 10, 60);
    let router = server.router();

    let response = send(&router, request("GET", "/", "10.0.0.1", "")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.hits(), 0);

    let response = send(&router, request("GET", "/set_rate?ip=10.0.0.1&value=2", "127.0.0.1", "")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
