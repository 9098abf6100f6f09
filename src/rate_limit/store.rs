//! Bucket persistence contract and the in-memory store.
//!
//! Every read-modify-write is a single store operation so concurrent
//! requests for the same client cannot lose updates.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::rate_limit::bucket::{Bucket, BucketSettings, TakeOutcome};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt bucket for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Transactional storage for token buckets, one record per client key.
#[async_trait]
pub trait BucketStore: Send + Sync + 'static {
    async fn find(&self, key: &str) -> Result<Option<Bucket>, StoreError>;

    /// Create the record unless one exists. Returns whether it was created.
    async fn insert_if_absent(&self, key: &str, bucket: Bucket) -> Result<bool, StoreError>;

    /// Atomically consume one token.
    async fn take_token(&self, key: &str) -> Result<TakeOutcome, StoreError>;

    /// Atomically add one token (capped). `None` when the record is gone.
    async fn refill(&self, key: &str) -> Result<Option<Bucket>, StoreError>;

    /// Atomically apply new settings. `None` when the record is missing.
    async fn update(&self, key: &str, settings: BucketSettings) -> Result<Option<Bucket>, StoreError>;

    /// Every client key currently persisted.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Process-local store for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<String, Bucket>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn find(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(self.buckets.get(key).map(|b| *b))
    }

    async fn insert_if_absent(&self, key: &str, bucket: Bucket) -> Result<bool, StoreError> {
        match self.buckets.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(bucket);
                Ok(true)
            }
        }
    }

    async fn take_token(&self, key: &str) -> Result<TakeOutcome, StoreError> {
        let Some(mut bucket) = self.buckets.get_mut(key) else {
            return Ok(TakeOutcome::Missing);
        };
        if bucket.take() {
            Ok(TakeOutcome::Taken {
                remaining: bucket.current,
            })
        } else {
            Ok(TakeOutcome::Empty)
        }
    }

    async fn refill(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(self.buckets.get_mut(key).map(|mut bucket| {
            bucket.refill();
            *bucket
        }))
    }

    async fn update(&self, key: &str, settings: BucketSettings) -> Result<Option<Bucket>, StoreError> {
        Ok(self.buckets.get_mut(key).map(|mut bucket| {
            bucket.apply(settings);
            *bucket
        }))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.buckets.iter().map(|entry| entry.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn insert_does_not_overwrite() {
        let store = MemoryStore::new();
        assert!(store.insert_if_absent("k", Bucket::seeded(1, 5)).await.unwrap());
        store.refill("k").await.unwrap();
        assert!(!store.insert_if_absent("k", Bucket::seeded(1, 5)).await.unwrap());
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 2);
    }

    #[tokio::test]
    async fn missing_keys() {
        let store = MemoryStore::new();
        assert_eq!(store.find("nobody").await.unwrap(), None);
        assert_eq!(store.take_token("nobody").await.unwrap(), TakeOutcome::Missing);
        assert_eq!(store.refill("nobody").await.unwrap(), None);
        assert_eq!(store.update("nobody", BucketSettings::rate(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_takes_never_overdraw() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_if_absent(
                "k",
                Bucket {
                    rate: 1,
                    max_tokens: 5,
                    current: 5,
                },
            )
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.take_token("k").await.unwrap() }));
        }

        let mut taken = 0;
        for h in handles {
            if matches!(h.await.unwrap(), TakeOutcome::Taken { .. }) {
                taken += 1;
            }
        }
        assert_eq!(taken, 5);
        assert_eq!(store.find("k").await.unwrap().unwrap().current, 0);
    }
}
