//! Kurento Media Server backend
//!
//! Implements the relay's media engine traits over Kurento's JSON-RPC
//! WebSocket protocol.

pub mod client;
pub mod element;
pub mod protocol;

use async_trait::async_trait;
use rtspcast_core::config::MediaConfig;
use rtspcast_core::engine::{EngineConnector, EngineResult, MediaEngine};
use std::sync::Arc;

pub use client::{ClientOptions, KurentoClient};
pub use element::{KurentoElement, KurentoEngine, KurentoPipeline};

/// Opens Kurento connections for the ingest manager
#[derive(Debug, Clone, Default)]
pub struct KurentoConnector {
    options: ClientOptions,
}

impl KurentoConnector {
    #[must_use]
    pub const fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(ClientOptions {
            request_timeout: config.request_timeout(),
            keepalive_interval: config.keepalive_interval(),
        })
    }
}

#[async_trait]
impl EngineConnector for KurentoConnector {
    async fn connect(&self, address: &str) -> EngineResult<Arc<dyn MediaEngine>> {
        let client = KurentoClient::connect(address, self.options.clone()).await?;
        Ok(Arc::new(KurentoEngine::new(client)))
    }
}
