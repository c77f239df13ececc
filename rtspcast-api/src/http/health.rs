//! Health check endpoints
//!
//! Provides a liveness probe and a JSON snapshot of the relay.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use rtspcast_core::IngestState;
use serde::Serialize;

use crate::http::AppState;

/// Relay status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub ingest: IngestState,
    pub reconnects: u64,
    pub sessions: usize,
    pub viewers: usize,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(status))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.registry.stats();
    Json(StatusResponse {
        ingest: state.ingest.state(),
        reconnects: state.ingest.reconnect_count(),
        sessions: stats.sessions,
        viewers: stats.viewers,
    })
}
