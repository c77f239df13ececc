pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod signaling;
pub mod types;
pub mod viewer;

pub use config::Config;
pub use error::{Error, Result};
pub use ingest::{IngestManager, IngestSettings, IngestState};
pub use session::{Claim, ConnectionHandle, Outbound, SessionRegistry};
pub use shutdown::ShutdownCoordinator;
pub use signaling::{Inbound, SignalingHandler, SignalingStream};
pub use types::{IceCandidate, SessionId};
pub use viewer::ViewerManager;
