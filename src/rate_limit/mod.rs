//! Per-client token-bucket rate limiting.
//!
//! # Data Flow
//! ```text
//! Admission (http/middleware/admission.rs):
//!     client key (salted hash of client IP)
//!     → get_tokens; unknown client → add_user (seed bucket, schedule refills)
//!     → remove_token (atomic store op) → admit or 429
//!
//! Refills (scheduler.rs):
//!     single worker, min-heap of deadlines
//!     → store.refill(key) once per bucket period, capped at capacity
//! ```
//!
//! # Design Decisions
//! - Buckets live in the store, so several balancer instances can share Redis
//! - Every mutation is one atomic store operation (Lua script or map entry lock)
//! - Admin updates restart the key's schedule so new timing applies immediately

pub mod bucket;
pub mod limiter;
pub mod redis_store;
pub mod scheduler;
pub mod store;

pub use bucket::{Bucket, BucketSettings, TakeOutcome, MAX_RATE_SECS};
pub use limiter::{LimiterError, TokenBucketLimiter};
pub use redis_store::RedisStore;
pub use scheduler::RefillScheduler;
pub use store::{BucketStore, MemoryStore, StoreError};
