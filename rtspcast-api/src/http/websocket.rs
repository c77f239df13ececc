//! Viewer signaling over WebSocket
//!
//! Adapts axum's `WebSocket` to the transport-agnostic [`SignalingStream`].
//! All protocol logic (join negotiation, candidate routing, heartbeat,
//! teardown) runs in `SignalingHandler::run`; this module only moves frames.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rtspcast_core::signaling::Connection;
use rtspcast_core::{Inbound, Outbound, SignalingStream};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::http::AppState;

/// Time the writer gets to flush its final frames after the loop ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket stream implementation of `SignalingStream`
struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl SignalingStream for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<Inbound, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(Inbound::Text(text.to_string()))),
                Some(Ok(Message::Pong(_))) => return Some(Ok(Inbound::Pong)),
                Some(Ok(Message::Close(_))) => return Some(Ok(Inbound::Close)),
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                None => return None,
                // Pings are answered by axum; binary frames are not part of the protocol
                Some(Ok(Message::Ping(_) | Message::Binary(_))) => {}
            }
        }
    }
}

/// WebSocket handler for viewer signaling
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let Connection {
        session_id,
        handle,
        outbound,
    } = state.signaling.accept();
    info!(%session_id, "WebSocket connection established");

    let (sink, receiver) = socket.split();
    let mut writer = tokio::spawn(write_frames(sink, outbound));

    let mut stream = WebSocketStream { receiver };
    state.signaling.run(session_id.clone(), handle.clone(), &mut stream).await;

    // Other handle clones may outlive the loop; an explicit close ends the writer
    handle.close();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(%session_id, "WebSocket connection closed");
}

/// Drain queued frames into the socket until a close frame or a send error
async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Outbound::Message(message) => match message.to_json() {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    error!(error = %e, "Failed to encode server message");
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Bytes::new()),
            Outbound::Close => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!(error = %e, "Failed to send close frame");
                }
                break;
            }
        };

        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Failed to send WebSocket message");
            break;
        }
    }
}
