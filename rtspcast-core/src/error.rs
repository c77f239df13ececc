use thiserror::Error;

use crate::engine::EngineError;
use crate::types::SessionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("No active streams available. Try again later")]
    NoActiveStream,

    #[error("You are already viewing in this session. Use a different browser to add additional viewers.")]
    AlreadyViewing,

    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    #[error("Ingest is already running")]
    AlreadyRunning,

    #[error("Ingest has been stopped")]
    IngestStopped,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
