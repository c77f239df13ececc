//! Signaling channel handler
//!
//! Runs the per-connection message loop independently of the transport.
//! The HTTP layer only provides a [`SignalingStream`] for inbound frames and
//! a writer task draining the connection's [`Outbound`] receiver.
//!
//! Join requests are negotiated in their own task so the connection keeps
//! processing candidates while the engine works; candidates are handled
//! inline and therefore stay in arrival order.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SignalingConfig;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{ConnectionHandle, Outbound};
use crate::types::SessionId;
use crate::viewer::ViewerManager;

/// Frame received from a viewer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Pong,
    Close,
}

/// Inbound half of a viewer connection
#[async_trait::async_trait]
pub trait SignalingStream: Send {
    /// Receive the next frame
    ///
    /// Returns `None` when the connection is gone
    async fn recv(&mut self) -> Option<Result<Inbound, String>>;
}

/// A freshly accepted connection
pub struct Connection {
    pub session_id: SessionId,
    pub handle: ConnectionHandle,
    /// Frames for the transport's writer task
    pub outbound: mpsc::Receiver<Outbound>,
}

pub struct SignalingHandler {
    viewers: Arc<ViewerManager>,
    heartbeat_interval: Duration,
    outbound_buffer: usize,
    shutdown: CancellationToken,
}

impl SignalingHandler {
    pub fn new(viewers: Arc<ViewerManager>, config: &SignalingConfig) -> Arc<Self> {
        Arc::new(Self {
            viewers,
            heartbeat_interval: config.heartbeat_interval(),
            outbound_buffer: config.outbound_buffer,
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn viewers(&self) -> &Arc<ViewerManager> {
        &self.viewers
    }

    /// Token cancelled when every connection loop must end
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Allocate the session of a new connection
    pub fn accept(&self) -> Connection {
        let (handle, outbound) = ConnectionHandle::channel(self.outbound_buffer);
        let session_id = self.viewers.registry().allocate_id(handle.clone());
        info!(%session_id, "Connection accepted");
        Connection {
            session_id,
            handle,
            outbound,
        }
    }

    /// Process a connection until it closes, fails, misses a heartbeat or
    /// the server shuts down; the session is removed afterwards
    pub async fn run<S: SignalingStream>(&self, session_id: SessionId, connection: ConnectionHandle, stream: &mut S) {
        let period = self.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut alive = true;

        loop {
            tokio::select! {
                frame = stream.recv() => match frame {
                    Some(Ok(Inbound::Text(text))) => self.dispatch(&session_id, &connection, &text).await,
                    Some(Ok(Inbound::Pong)) => {
                        trace!(%session_id, "Pong");
                        alive = true;
                    }
                    Some(Ok(Inbound::Close)) | None => {
                        info!(%session_id, "Connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%session_id, error = %e, "Connection error");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    if !alive {
                        info!(%session_id, "Heartbeat missed, terminating connection");
                        connection.close();
                        break;
                    }
                    alive = false;
                    trace!(%session_id, "Ping");
                    connection.ping();
                }
                () = self.shutdown.cancelled() => {
                    debug!(%session_id, "Server shutting down, closing connection");
                    connection.close();
                    break;
                }
            }
        }

        self.viewers.registry().remove(&session_id).await;
    }

    /// Handle one text frame
    pub async fn dispatch(&self, session_id: &SessionId, connection: &ConnectionHandle, text: &str) {
        debug!(%session_id, message = text, "Received message");
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Viewer { sdp_offer }) => {
                let viewers = Arc::clone(&self.viewers);
                let session_id = session_id.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    let reply = match viewers.request_view(&session_id, &sdp_offer).await {
                        Ok(answer) => ServerMessage::accepted(answer),
                        Err(e) => ServerMessage::rejected(e.to_string()),
                    };
                    connection.deliver(reply).await;
                });
            }
            Ok(ClientMessage::OnIceCandidate { candidate }) => {
                self.viewers.add_ice_candidate(session_id, candidate).await;
            }
            Err(e) => {
                debug!(%session_id, error = %e, "Invalid message");
                connection.send(ServerMessage::error(format!("Invalid message {text}")));
            }
        }
    }
}
