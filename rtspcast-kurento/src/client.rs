//! Kurento control connection
//!
//! One WebSocket carries every request of this process. A writer task
//! drains outgoing frames, a reader task completes pending requests and
//! routes element events to subscribers, and a keepalive task pings the
//! server so it keeps our objects alive. When the socket goes away every
//! pending request fails with [`EngineError::Closed`] and every
//! subscription ends.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rtspcast_core::engine::{EngineError, EngineResult, EventKind, MediaEvent, Subscription};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{self, Frame, Request, ResponseResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = oneshot::Sender<EngineResult<ResponseResult>>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    /// Zero disables the keepalive
    pub keepalive_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(240),
        }
    }
}

/// State shared between the client handles and the connection tasks
struct Shared {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, Pending>>,
    subscribers: Mutex<HashMap<(String, EventKind), Vec<mpsc::UnboundedSender<MediaEvent>>>>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: CancellationToken,
}

impl Shared {
    fn complete(&self, id: u64, result: Result<ResponseResult, protocol::RpcError>) {
        let Some(waiter) = self.pending.lock().remove(&id) else {
            debug!(id, "Response for unknown request");
            return;
        };
        let result = result.map_err(EngineError::from);
        if let Ok(ResponseResult {
            session_id: Some(session_id),
            ..
        }) = &result
        {
            let mut current = self.session_id.lock();
            if current.as_deref() != Some(session_id.as_str()) {
                debug!(session_id = %session_id, "Media server session assigned");
                *current = Some(session_id.clone());
            }
        }
        let _ = waiter.send(result);
    }

    fn dispatch_event(&self, event: protocol::ElementEvent) {
        let mut subscribers = self.subscribers.lock();
        let key = (event.object, event.kind);
        let Some(senders) = subscribers.get_mut(&key) else {
            trace!(object = %key.0, kind = ?key.1, "Event without subscribers");
            return;
        };
        senders.retain(|tx| tx.send(event.event.clone()).is_ok());
        if senders.is_empty() {
            subscribers.remove(&key);
        }
    }

    /// Fail every in-flight request and end every subscription
    fn shut(&self) {
        self.closed.cancel();
        let pending: Vec<Pending> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            warn!(requests = pending.len(), "Failing in-flight media server requests");
        }
        for waiter in pending {
            let _ = waiter.send(Err(EngineError::Closed));
        }
        self.subscribers.lock().clear();
    }
}

/// Handle to a Kurento connection; clones share the socket
///
/// The connection is closed once the last handle is dropped.
#[derive(Clone)]
pub struct KurentoClient {
    shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

impl KurentoClient {
    pub async fn connect(address: &str, options: ClientOptions) -> EngineResult<Self> {
        let (ws, _) = connect_async(address)
            .await
            .map_err(|e| EngineError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        info!(address, "Connected to media server");

        let (write, read) = ws.split();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let shared = Arc::new(Shared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            request_timeout: options.request_timeout,
            closed: closed.clone(),
        });

        tokio::spawn(writer_task(write, rx, closed.clone()));
        tokio::spawn(reader_task(read, Arc::clone(&shared)));

        let client = Self {
            shared,
            _guard: Arc::new(closed.drop_guard()),
        };
        if !options.keepalive_interval.is_zero() {
            tokio::spawn(keepalive_task(
                Arc::clone(&client.shared),
                options.keepalive_interval,
            ));
        }
        Ok(client)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().clone()
    }

    /// Send one request and wait for its response
    pub async fn request(&self, method: &str, params: Value) -> EngineResult<ResponseResult> {
        send_request(&self.shared, method, params).await
    }

    /// Create a media object, returning its id
    pub async fn create(&self, object_type: &str, constructor_params: Value) -> EngineResult<String> {
        let result = self
            .request("create", protocol::create_params(object_type, constructor_params))
            .await?;
        match result.value {
            Some(Value::String(id)) => {
                debug!(object_type, id = %id, "Media object created");
                Ok(id)
            }
            other => Err(EngineError::Protocol(format!(
                "create {object_type} returned {other:?}"
            ))),
        }
    }

    /// Invoke an operation on a media object, returning its value
    pub async fn invoke(&self, object: &str, operation: &str, params: Value) -> EngineResult<Value> {
        let result = self
            .request("invoke", protocol::invoke_params(object, operation, params))
            .await?;
        Ok(result.value.unwrap_or(Value::Null))
    }

    pub async fn release(&self, object: &str) -> EngineResult<()> {
        self.request("release", protocol::release_params(object)).await?;
        debug!(object, "Media object released");
        Ok(())
    }

    /// Subscribe to an element event
    ///
    /// The local route is installed before the request is sent so events
    /// raised right after the server accepts it are not lost.
    pub async fn subscribe(&self, object: &str, kind: EventKind) -> EngineResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = (object.to_string(), kind);
        self.shared
            .subscribers
            .lock()
            .entry(key.clone())
            .or_default()
            .push(tx);

        match self.request("subscribe", protocol::subscribe_params(object, kind)).await {
            Ok(result) => {
                let id = match result.value {
                    Some(Value::String(id)) => id,
                    _ => String::new(),
                };
                Ok(Subscription::new(id, rx))
            }
            Err(e) => {
                drop(rx);
                let mut subscribers = self.shared.subscribers.lock();
                if let Some(senders) = subscribers.get_mut(&key) {
                    senders.retain(|tx| !tx.is_closed());
                    if senders.is_empty() {
                        subscribers.remove(&key);
                    }
                }
                Err(e)
            }
        }
    }
}

async fn send_request(shared: &Shared, method: &str, params: Value) -> EngineResult<ResponseResult> {
    if shared.closed.is_cancelled() {
        return Err(EngineError::Closed);
    }

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let session_id = shared.session_id.lock().clone();
    let request = Request::new(id, method, params, session_id.as_deref());
    let text = serde_json::to_string(&request).map_err(|e| EngineError::Protocol(e.to_string()))?;

    let (tx, rx) = oneshot::channel();
    shared.pending.lock().insert(id, tx);
    trace!(id, method, "Sending media server request");
    if shared.outgoing.send(Message::Text(text.into())).is_err() {
        shared.pending.lock().remove(&id);
        return Err(EngineError::Closed);
    }

    match tokio::time::timeout(shared.request_timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(EngineError::Closed),
        Err(_) => {
            shared.pending.lock().remove(&id);
            Err(EngineError::Timeout(format!("{method} (request {id})")))
        }
    }
}

async fn writer_task(
    mut write: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = write.send(message).await {
                    error!("Failed to send media server frame: {}", e);
                    break;
                }
            }
            () = closed.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }
    closed.cancel();
    debug!("Media server writer terminated");
}

async fn reader_task(mut read: futures::stream::SplitStream<WsStream>, shared: Arc<Shared>) {
    loop {
        let message = tokio::select! {
            message = read.next() => message,
            () = shared.closed.cancelled() => break,
        };
        match message {
            Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str()) {
                Ok(Frame::Response { id, result }) => shared.complete(id, result),
                Ok(Frame::Event(event)) => shared.dispatch_event(event),
                Ok(Frame::Ignored) => trace!(frame = %text.as_str(), "Ignored media server frame"),
                Err(e) => warn!(error = %e, "Undecodable media server frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                warn!("Media server connection closed");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Media server connection error: {}", e);
                break;
            }
        }
    }
    shared.shut();
    debug!("Media server reader terminated");
}

/// Keeps the server-side session alive while the process runs
async fn keepalive_task(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let interval_ms = u64::try_from(period.as_millis().saturating_mul(2)).unwrap_or(u64::MAX);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = send_request(&shared, "ping", json!({ "interval": interval_ms })).await {
                    debug!(error = %e, "Media server ping failed");
                }
            }
            () = shared.closed.cancelled() => break,
        }
    }
}
