//! Media engine abstraction
//!
//! The relay never touches media itself. Decoding, relaying and
//! transport-level connectivity happen in an external engine reached
//! through these traits, so the orchestration logic can run against the
//! real engine client or the in-memory [`mock`] engine.

pub mod mock;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::IceCandidate;

/// Errors reported by the media engine or its control channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("could not reach media engine at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("engine request failed ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("engine request timed out: {0}")]
    Timeout(String),

    #[error("engine connection closed")]
    Closed,

    #[error("engine protocol error: {0}")]
    Protocol(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Events an element can be subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EndOfStream,
    IceCandidate,
}

/// Notification raised by an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    EndOfStream,
    IceCandidate(IceCandidate),
}

/// Live event feed for one `(element, event kind)` pair
///
/// Dropping the subscription unregisters the handler: the engine side
/// discards senders whose receiver is gone.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    receiver: mpsc::UnboundedReceiver<MediaEvent>,
}

impl Subscription {
    #[must_use]
    pub const fn new(id: String, receiver: mpsc::UnboundedReceiver<MediaEvent>) -> Self {
        Self { id, receiver }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next event; `None` once the element or engine is gone
    pub async fn recv(&mut self) -> Option<MediaEvent> {
        self.receiver.recv().await
    }
}

/// Parameters of the ingest (player) endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerOptions {
    pub uri: String,
    /// Relay encoded media as-is instead of decoding it
    pub use_encoded_media: bool,
    /// Jitter buffer in milliseconds
    pub network_cache: u32,
}

impl PlayerOptions {
    /// Live passthrough: no re-encoding, no buffering
    pub fn live(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            use_encoded_media: true,
            network_cache: 0,
        }
    }
}

/// Opens control connections to a media engine
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, address: &str) -> EngineResult<Arc<dyn MediaEngine>>;
}

/// A connected media engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_pipeline(&self) -> EngineResult<Arc<dyn MediaPipeline>>;
}

/// Processing context owning every endpoint of this relay
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    fn id(&self) -> &str;

    /// Create the ingest endpoint pulling from a live source
    async fn create_player(&self, options: &PlayerOptions) -> EngineResult<Arc<dyn MediaElement>>;

    /// Create a per-viewer relay endpoint
    async fn create_webrtc_endpoint(&self) -> EngineResult<Arc<dyn MediaElement>>;

    /// Release the pipeline together with every element it owns
    async fn release(&self) -> EngineResult<()>;
}

/// An element inside a pipeline
///
/// Player and relay endpoints share one interface; operations that do not
/// apply to an element kind are rejected by the engine.
#[async_trait]
pub trait MediaElement: Send + Sync {
    fn id(&self) -> &str;

    async fn play(&self) -> EngineResult<()>;

    async fn stop(&self) -> EngineResult<()>;

    async fn release(&self) -> EngineResult<()>;

    /// Route this element's media into `sink`
    async fn connect(&self, sink: &dyn MediaElement) -> EngineResult<()>;

    /// Apply a remote offer, returning the local answer
    async fn process_offer(&self, offer: &str) -> EngineResult<String>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> EngineResult<()>;

    async fn gather_candidates(&self) -> EngineResult<()>;

    /// Playback position in milliseconds
    async fn get_position(&self) -> EngineResult<i64>;

    async fn subscribe(&self, kind: EventKind) -> EngineResult<Subscription>;
}

impl fmt::Debug for dyn MediaElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaElement").field("id", &self.id()).finish()
    }
}

impl fmt::Debug for dyn MediaPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPipeline").field("id", &self.id()).finish()
    }
}
