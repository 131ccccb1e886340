//! Admin API request handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::stats::{format_uptime, CrawlStats};

use super::workers::{WorkerRegistry, WorkerState};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<CrawlStats>,
    pub workers: Arc<WorkerRegistry>,
    pub prometheus: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    rate: f64,
    crawled: u64,
    #[serde(rename = "crawledSeeds")]
    crawled_seeds: u64,
    #[serde(rename = "crawledAssets")]
    crawled_assets: u64,
    queued: u64,
    uptime: String,
    state: &'static str,
}

/// GET /: headline crawl statistics
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = &state.stats;
    Json(StatusResponse {
        rate: stats.uri_rate.rate(),
        crawled: stats.crawled_total(),
        crawled_seeds: stats.crawled_seeds.get(),
        crawled_assets: stats.crawled_assets.get(),
        queued: stats.queued.get(),
        uptime: format_uptime(stats.uptime()),
        state: stats.state().as_str(),
    })
}

/// GET /metrics: Prometheus exposition, when enabled
pub async fn metrics(State(state): State<AppState>) -> Response {
    if !state.prometheus {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.stats.to_prometheus(),
    )
        .into_response()
}

#[derive(Serialize)]
pub struct WorkersResponse {
    workers: Vec<WorkerState>,
}

/// GET /workers: every worker slot state
pub async fn workers(State(state): State<AppState>) -> Json<WorkersResponse> {
    Json(WorkersResponse {
        workers: state.workers.all(),
    })
}

/// GET /worker/{id}: one worker slot, or 404
pub async fn worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Response {
    let Ok(id) = worker_id.parse::<usize>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "unsupported worker id"})),
        )
            .into_response();
    };
    match state.workers.get(id) {
        Some(worker) => Json(worker).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "worker not found"})),
        )
            .into_response(),
    }
}
