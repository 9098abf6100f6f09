//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Tick source (interval)
//!     → Probe each backend concurrently (GET {url}/health, bounded timeout)
//!     → 200 marks alive, anything else marks dead
//!
//! Passive failure detection lives in the balancer:
//!     5xx or transport error on a forward
//!     → backend marked dead until the next successful probe
//! ```
//!
//! # Design Decisions
//! - One probe decides; no hysteresis, so recovery happens within one interval
//! - Health state is per-backend, not per-pool
//! - Probes are the only path back into rotation

pub mod active;

pub use active::{HealthMonitor, ProbeOutcome, TickSource};
