//! Route definitions

use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers;

/// Create the main router with all routes
pub fn create_router() -> Router {
    Router::new()
        // Health endpoint (excluded from rate limiting)
        .route("/health", get(handlers::health::health_check))
        // Echo API (v1)
        .route("/v1/echo", post(handlers::echo::echo))
}
