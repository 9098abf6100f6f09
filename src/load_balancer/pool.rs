//! Backend pool management.
//!
//! # Responsibilities
//! - Hold the ordered set of backends built from configuration
//! - Hand out snapshots to the selection strategy and the health monitor

use std::sync::{Arc, PoisonError, RwLock};

use crate::load_balancer::backend::{Backend, BackendError, ForwardOptions};

/// Ordered collection of backends. Registration order is the tie-break order.
#[derive(Debug, Default)]
pub struct BackendPool {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from backend URLs. Any malformed URL fails the whole pool.
    pub fn from_urls<S: AsRef<str>>(urls: &[S], options: ForwardOptions) -> Result<Self, BackendError> {
        let pool = Self::new();
        for url in urls {
            pool.add(Arc::new(Backend::new(url.as_ref(), options)?));
        }
        Ok(pool)
    }

    pub fn add(&self, backend: Arc<Backend>) {
        tracing::info!(backend = %backend.label(), "Backend registered");
        self.backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(backend);
    }

    /// Cheap snapshot; the lock is held only for the clone.
    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.backends.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
