//! Administrative endpoints for per-client bucket settings.
//!
//! Mounted outside the admission layer so operators are never rate limited
//! while fixing a limit.

pub mod handlers;

use axum::{routing::get, Router};

use crate::http::server::AppState;
use self::handlers::{set_max, set_rate};

pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/set_rate", get(set_rate).post(set_rate))
        .route("/set_max", get(set_max).post(set_max))
}
