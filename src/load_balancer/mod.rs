//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Admitted request
//!     → balancer.rs (attempt loop, bounded by pool size)
//!     → pool.rs (snapshot of registered backends)
//!     → least_conn.rs (pick alive backend with fewest connections)
//!     → backend.rs (connection guard, forward, buffered response)
//!     → commit 2xx-4xx or fail over on 5xx
//! ```
//!
//! # Design Decisions
//! - Strategy is stateless; backends track their own connections
//! - Unhealthy backends excluded from selection
//! - Pool is fixed after startup

use std::fmt::Debug;
use std::sync::Arc;

pub mod backend;
pub mod balancer;
pub mod least_conn;
pub mod pool;

pub use backend::{Backend, BackendError, ForwardOptions};
pub use balancer::Balancer;
pub use pool::BackendPool;

/// Backend selection strategy over a pool snapshot.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Pick the next backend, or `None` when nothing is eligible.
    fn next_server(&self, backends: &[Arc<backend::Backend>]) -> Option<Arc<backend::Backend>>;
}
