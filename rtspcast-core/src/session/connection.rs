//! Outbound half of a viewer connection

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ServerMessage;

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close,
}

/// Non-owning handle used to push events to a viewer connection
///
/// [`send`](Self::send) never blocks: when the writer falls behind or has
/// gone away the frame is dropped and the caller gets `false`. Join
/// responses go through [`deliver`](Self::deliver) and close frames are
/// deferred rather than dropped, so a slow viewer still learns the outcome
/// of its join and still gets closed.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    #[must_use]
    pub const fn new(sender: mpsc::Sender<Outbound>) -> Self {
        Self { sender }
    }

    /// Create a handle together with the receiver its writer task drains
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn send(&self, message: ServerMessage) -> bool {
        self.push(Outbound::Message(message))
    }

    /// Queue `message`, waiting for room in the buffer
    ///
    /// Returns `false` once the connection has gone away.
    pub async fn deliver(&self, message: ServerMessage) -> bool {
        if self.sender.send(Outbound::Message(message)).await.is_err() {
            debug!("Outbound channel closed: viewer disconnected");
            return false;
        }
        true
    }

    pub fn ping(&self) -> bool {
        self.push(Outbound::Ping)
    }

    /// Ask the writer to close the connection after the frames already queued
    ///
    /// Must be called within the runtime: with a full buffer the close frame
    /// is handed to a task that waits for room.
    pub fn close(&self) -> bool {
        match self.sender.try_send(Outbound::Close) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!("Outbound channel full, deferring close");
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(frame).await;
                });
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn push(&self, frame: Outbound) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound channel full: viewer too slow to consume messages");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound channel closed: viewer disconnected");
                false
            }
        }
    }
}
