//! Token-bucket rate limiter.
//!
//! Buckets persist in a [`BucketStore`]; refills run on the shared
//! [`RefillScheduler`]. The limiter itself holds no per-client state.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;
use crate::lifecycle::ShutdownSignal;
use crate::rate_limit::bucket::{Bucket, BucketSettings, TakeOutcome, MAX_RATE_SECS};
use crate::rate_limit::scheduler::RefillScheduler;
use crate::rate_limit::store::{BucketStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("no bucket for client {0}")]
    NotFound(String),
    #[error("no tokens left")]
    NoTokens,
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct TokenBucketLimiter {
    store: Arc<dyn BucketStore>,
    scheduler: Arc<RefillScheduler>,
    default_max_tokens: i64,
    default_rate_secs: u64,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn BucketStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            scheduler: Arc::new(RefillScheduler::new()),
            default_max_tokens: config.default_max_tokens,
            default_rate_secs: config.default_rate_secs,
        }
    }

    pub fn scheduler(&self) -> &Arc<RefillScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    /// Start the refill worker. It stops when `shutdown` fires or on [`stop_all`](Self::stop_all).
    pub fn spawn_refills(&self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(self.scheduler.clone().run(self.store.clone(), shutdown))
    }

    /// Register a first-time client with the default bucket and start its refills.
    ///
    /// A concurrent insert for the same key wins silently; its bucket is kept.
    pub async fn add_user(&self, key: &str) -> Result<(), LimiterError> {
        let bucket = Bucket::seeded(self.default_rate_secs, self.default_max_tokens);
        let inserted = self.store.insert_if_absent(key, bucket).await?;

        if inserted {
            tracing::info!(
                client = %key,
                rate_secs = bucket.rate,
                max_tokens = bucket.max_tokens,
                "Added new client bucket"
            );
            self.scheduler.schedule(key, bucket.refill_period());
        } else if !self.scheduler.is_scheduled(key) {
            let period = self.bucket(key).await?.refill_period();
            self.scheduler.schedule(key, period);
        }
        Ok(())
    }

    async fn bucket(&self, key: &str) -> Result<Bucket, LimiterError> {
        self.store
            .find(key)
            .await?
            .ok_or_else(|| LimiterError::NotFound(key.to_string()))
    }

    pub async fn get_tokens(&self, key: &str) -> Result<i64, LimiterError> {
        Ok(self.bucket(key).await?.current)
    }

    pub async fn get_rate(&self, key: &str) -> Result<u64, LimiterError> {
        Ok(self.bucket(key).await?.rate)
    }

    pub async fn get_max_tokens(&self, key: &str) -> Result<i64, LimiterError> {
        Ok(self.bucket(key).await?.max_tokens)
    }

    /// Consume one token; returns how many remain.
    pub async fn remove_token(&self, key: &str) -> Result<i64, LimiterError> {
        match self.store.take_token(key).await? {
            TakeOutcome::Taken { remaining } => Ok(remaining),
            TakeOutcome::Empty => Err(LimiterError::NoTokens),
            TakeOutcome::Missing => Err(LimiterError::NotFound(key.to_string())),
        }
    }

    /// Seconds between refills, `1..=MAX_RATE_SECS`. Takes effect immediately.
    pub async fn set_rate(&self, key: &str, rate: i64) -> Result<(), LimiterError> {
        let rate = u64::try_from(rate)
            .ok()
            .filter(|r| (1..=MAX_RATE_SECS).contains(r))
            .ok_or(LimiterError::InvalidValue { field: "rate", value: rate })?;
        self.apply(key, BucketSettings::rate(rate)).await
    }

    /// Capacity; current tokens are clamped down when it shrinks.
    pub async fn set_max_tokens(&self, key: &str, max: i64) -> Result<(), LimiterError> {
        if max < 0 {
            return Err(LimiterError::InvalidValue {
                field: "max_tokens",
                value: max,
            });
        }
        self.apply(key, BucketSettings::max_tokens(max)).await
    }

    async fn apply(&self, key: &str, settings: BucketSettings) -> Result<(), LimiterError> {
        let bucket = self
            .store
            .update(key, settings)
            .await?
            .ok_or_else(|| LimiterError::NotFound(key.to_string()))?;

        self.scheduler.schedule(key, bucket.refill_period());
        tracing::info!(
            client = %key,
            rate_secs = bucket.rate,
            max_tokens = bucket.max_tokens,
            current = bucket.current,
            "Updated client bucket"
        );
        Ok(())
    }

    /// Resume refills for every bucket already in the store. Returns how many were scheduled.
    pub async fn restore(&self) -> Result<usize, LimiterError> {
        let keys = self.store.keys().await?;
        let mut restored = 0;

        for key in keys {
            match self.store.find(&key).await? {
                Some(bucket) => {
                    self.scheduler.schedule(&key, bucket.refill_period());
                    restored += 1;
                }
                None => tracing::debug!(client = %key, "Bucket vanished during restore"),
            }
        }

        tracing::info!(count = restored, "Restored refill schedules");
        Ok(restored)
    }

    pub fn stop_all(&self) {
        self.scheduler.stop_all();
    }
}
