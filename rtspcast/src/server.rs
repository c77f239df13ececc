//! Server lifecycle management
//!
//! Wires the relay components together, starts the ingest, serves HTTP and
//! tears everything down on a signal or a fatal ingest failure.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use rtspcast_api::{create_router, AppState};
use rtspcast_core::{
    Config, IngestManager, IngestSettings, IngestState, SessionRegistry, ShutdownCoordinator,
    SignalingHandler, ViewerManager,
};
use rtspcast_kurento::KurentoConnector;

/// Time the HTTP server gets to finish in-flight requests
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RelayServer {
    config: Config,
    ingest: Arc<IngestManager>,
    signaling: Arc<SignalingHandler>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl RelayServer {
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new();
        let ingest = IngestManager::new(
            Arc::new(KurentoConnector::from_config(&config.media)),
            IngestSettings::from(&config.media),
            Arc::clone(&registry),
        );
        let viewers = ViewerManager::new(Arc::clone(&registry), Arc::clone(&ingest));
        let signaling = SignalingHandler::new(viewers, &config.signaling);
        let shutdown = ShutdownCoordinator::new(registry, Arc::clone(&ingest), signaling.shutdown_token());

        Self {
            config,
            ingest,
            signaling,
            shutdown,
        }
    }

    /// Run until SIGINT/SIGTERM (`Ok`) or until the ingest or the HTTP
    /// server fails (`Err`); the relay is shut down in every case
    pub async fn run(self) -> Result<()> {
        let source_uri = self.config.media.source_uri.clone();
        if let Err(e) = self.ingest.start(&source_uri).await {
            error!(uri = %source_uri, error = %e, "Failed to start ingest");
            self.shutdown.shutdown().await;
            return Err(anyhow!("Failed to start ingest from {source_uri}: {e}"));
        }

        let http_address = self.config.http_address();
        let listener = match tokio::net::TcpListener::bind(&http_address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind HTTP address {}: {}", http_address, e);
                self.shutdown.shutdown().await;
                return Err(anyhow!("Failed to bind HTTP address {http_address}: {e}"));
            }
        };
        info!("HTTP server listening on {}", http_address);
        info!("Viewer signaling on {}", self.config.server.ws_path);

        let router = create_router(
            AppState::new(Arc::clone(&self.signaling), &self.config.signaling),
            &self.config.server,
        );
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let graceful = async move {
            let _ = shutdown_rx.changed().await;
        };
        let mut http = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
        });

        let outcome = tokio::select! {
            () = shutdown_signal() => Ok(()),
            () = ingest_failed(self.ingest.subscribe_state()) => {
                error!("Ingest failed permanently");
                Err(anyhow!("Ingest from {source_uri} failed"))
            }
            result = &mut http => match result {
                Ok(Ok(())) => Err(anyhow!("HTTP server stopped unexpectedly")),
                Ok(Err(e)) => Err(anyhow!("HTTP server error: {e}")),
                Err(e) => Err(anyhow!("HTTP server task failed: {e}")),
            },
        };

        // Closes the signaling loops so the HTTP server can drain
        self.shutdown.shutdown().await;
        let _ = shutdown_tx.send(true);

        if !http.is_finished() {
            match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, &mut http).await {
                Ok(Ok(Err(e))) => warn!("HTTP server error during shutdown: {}", e),
                Ok(_) => info!("HTTP server shut down gracefully"),
                Err(_) => {
                    warn!("HTTP server did not drain in time");
                    http.abort();
                }
            }
        }

        outcome
    }
}

/// Resolve once the ingest reaches `Failed`
async fn ingest_failed(mut state: watch::Receiver<IngestState>) {
    if state.wait_for(|s| *s == IngestState::Failed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
