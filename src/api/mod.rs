//! Admin HTTP API
//!
//! Axum-based surface exposing live crawl statistics, Prometheus metrics,
//! and per-worker state.

mod handlers;
mod routes;
mod server;
mod workers;

pub use handlers::AppState;
pub use routes::create_router;
pub use server::ApiServer;
pub use workers::{WorkerRegistry, WorkerState};
