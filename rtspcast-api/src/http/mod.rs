// Module: http
// Viewer signaling endpoint, static client and health probes

pub mod health;
pub mod websocket;

use axum::{http::StatusCode, routing::get, Router};
use rtspcast_core::config::{ServerConfig, SignalingConfig};
use rtspcast_core::{IngestManager, SessionRegistry, SignalingHandler};
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub signaling: Arc<SignalingHandler>,
    pub ingest: Arc<IngestManager>,
    pub registry: Arc<SessionRegistry>,
    /// Inbound WebSocket message limit in bytes
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(signaling: Arc<SignalingHandler>, config: &SignalingConfig) -> Self {
        let viewers = signaling.viewers();
        Self {
            ingest: Arc::clone(viewers.ingest()),
            registry: Arc::clone(viewers.registry()),
            max_message_size: config.max_message_size,
            signaling,
        }
    }
}

/// Create the HTTP router with all routes
///
/// Paths not matched by a route are served from `static_dir`; paths that
/// escape the root or do not exist yield 404.
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route(&config.ws_path, get(websocket::websocket_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .merge(health::create_health_router())
        .fallback_service(ServeDir::new(&config.static_dir).append_index_html_on_directories(true))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
