//! Admin API route definitions

use axum::routing::get;
use axum::Router;

use super::handlers::{self, AppState};

/// Build the admin API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::status))
        .route("/metrics", get(handlers::metrics))
        .route("/workers", get(handlers::workers))
        .route("/worker/:worker_id", get(handlers::worker))
        .with_state(state)
}
