//! Startup wiring: store connection and fatal startup errors.

use std::sync::Arc;

use crate::config::{ConfigError, RateLimitConfig, StoreKind};
use crate::load_balancer::BackendError;
use crate::rate_limit::{BucketStore, LimiterError, MemoryStore, RedisStore, StoreError};

/// Anything that stops the process before it serves traffic.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid backend: {0}")]
    Backend(#[from] BackendError),
    #[error("bucket store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("failed to restore refill schedules: {0}")]
    Restore(#[from] LimiterError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Open the configured bucket store. Redis is pinged so a dead server fails startup.
pub async fn connect_store(config: &RateLimitConfig) -> Result<Arc<dyn BucketStore>, StartupError> {
    match config.store {
        StoreKind::Memory => {
            tracing::info!("Using in-memory bucket store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreKind::Redis => {
            let store = RedisStore::connect(&config.redis_url, config.key_prefix.clone()).await?;
            tracing::info!(url = %config.redis_url, prefix = %config.key_prefix, "Connected to Redis");
            Ok(Arc::new(store))
        }
    }
}
