//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, request ID, tracing, timeout)
//!     → middleware/admission.rs (client key, token charge, 429/500)
//!     → load_balancer::Balancer (least connections, bounded failover)
//!     → response.rs (envelope for locally generated replies)
//!     → Send to client
//! ```

pub mod middleware;
pub mod response;
pub mod server;

pub use response::{error_response, ApiResponse};
pub use server::{AppState, HttpServer, X_REQUEST_ID};
