//! Shutdown coordination
//!
//! Tears the relay down on termination: viewer sessions first, then the
//! ingest monitor and the shared pipeline. Release failures are logged by
//! the components and never stop the sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ingest::IngestManager;
use crate::session::SessionRegistry;

pub struct ShutdownCoordinator {
    registry: Arc<SessionRegistry>,
    ingest: Arc<IngestManager>,
    connections: CancellationToken,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    /// `connections` is cancelled to end every open signaling loop
    pub fn new(registry: Arc<SessionRegistry>, ingest: Arc<IngestManager>, connections: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ingest,
            connections,
            started: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Release every session and the pipeline
    ///
    /// Safe to call more than once and without a running ingest; later
    /// calls only sweep what appeared since.
    pub async fn shutdown(&self) -> usize {
        if !self.started.swap(true, Ordering::AcqRel) {
            info!("Shutting down relay");
        }
        self.connections.cancel();

        let sessions = self.registry.remove_all().await;
        self.ingest.stop().await;

        info!(sessions, "Relay shut down");
        sessions
    }
}
