// rtspcast API Library
//
// Provides the HTTP surface of the relay: viewer signaling over WebSocket,
// static client assets and health probes

pub mod http;

// Re-export commonly used types
pub use http::{create_router, AppState};
