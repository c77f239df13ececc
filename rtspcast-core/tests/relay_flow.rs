//! End-to-end relay behavior against the in-memory engine

use std::sync::Arc;
use std::time::Duration;

use rtspcast_core::config::{MediaConfig, SignalingConfig};
use rtspcast_core::engine::mock::{MockConnector, MockEngine, MockOp};
use rtspcast_core::engine::{EventKind, MediaElement, MediaEvent};
use rtspcast_core::protocol::ServerMessage;
use rtspcast_core::signaling::{Inbound, SignalingStream};
use rtspcast_core::{
    ConnectionHandle, Error, IceCandidate, IngestManager, IngestSettings, IngestState, Outbound,
    SessionId, SessionRegistry, ShutdownCoordinator, SignalingHandler, ViewerManager,
};
use tokio::sync::mpsc;

struct Relay {
    engine: Arc<MockEngine>,
    registry: Arc<SessionRegistry>,
    ingest: Arc<IngestManager>,
    viewers: Arc<ViewerManager>,
    signaling: Arc<SignalingHandler>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Relay {
    fn new() -> Self {
        let engine = MockEngine::new();
        let registry = SessionRegistry::new();
        let ingest = IngestManager::new(
            MockConnector::new(Arc::clone(&engine)),
            IngestSettings::from(&MediaConfig::default()),
            Arc::clone(&registry),
        );
        let viewers = ViewerManager::new(Arc::clone(&registry), Arc::clone(&ingest));
        let signaling = SignalingHandler::new(Arc::clone(&viewers), &SignalingConfig::default());
        let shutdown = ShutdownCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&ingest),
            signaling.shutdown_token(),
        );
        Self {
            engine,
            registry,
            ingest,
            viewers,
            signaling,
            shutdown,
        }
    }

    async fn started() -> Self {
        let relay = Self::new();
        relay.ingest.start("rtsp://camera/live").await.unwrap();
        relay
    }

    fn connect(&self) -> (SessionId, mpsc::Receiver<Outbound>) {
        let (handle, outbound) = ConnectionHandle::channel(64);
        (self.registry.allocate_id(handle), outbound)
    }

    async fn join(&self) -> SessionId {
        let (id, _outbound) = self.connect();
        self.viewers.request_view(&id, "v=0").await.unwrap();
        id
    }
}

struct ChannelStream(mpsc::UnboundedReceiver<Inbound>);

#[async_trait::async_trait]
impl SignalingStream for ChannelStream {
    async fn recv(&mut self) -> Option<Result<Inbound, String>> {
        self.0.recv().await.map(Ok)
    }
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 UDP 2122 10.0.0.{n} 5000 typ host"), "0", 0)
}

/// Let spawned work run without reaching the next health probe
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_session_ids_fill_lowest_gap() {
    let relay = Relay::new();
    let (first, _a) = relay.connect();
    let (second, _b) = relay.connect();
    assert_eq!(first.as_str(), "0");
    assert_eq!(second.as_str(), "1");

    relay.registry.remove(&first).await;
    let (third, _c) = relay.connect();
    let (fourth, _d) = relay.connect();

    assert_eq!(third.as_str(), "0");
    assert_eq!(fourth.as_str(), "2");
}

#[tokio::test(start_paused = true)]
async fn test_early_candidates_applied_in_order_once() {
    let relay = Relay::started().await;
    relay.engine.delay(MockOp::CreateWebRtcEndpoint, Duration::from_millis(100));
    let (id, _outbound) = relay.connect();

    relay.viewers.add_ice_candidate(&id, candidate(1)).await;
    relay.viewers.add_ice_candidate(&id, candidate(2)).await;

    let join = {
        let viewers = Arc::clone(&relay.viewers);
        let id = id.clone();
        tokio::spawn(async move { viewers.request_view(&id, "v=0").await })
    };
    // Arrives while the endpoint is being created
    tokio::time::sleep(Duration::from_millis(50)).await;
    relay.viewers.add_ice_candidate(&id, candidate(3)).await;

    join.await.unwrap().unwrap();
    relay.viewers.add_ice_candidate(&id, candidate(4)).await;

    let endpoint = &relay.engine.webrtc_endpoints()[0];
    assert_eq!(
        endpoint.candidates(),
        vec![candidate(1), candidate(2), candidate(3), candidate(4)]
    );
    assert_eq!(relay.registry.queued_candidates(&id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_join_rejected_first_untouched() {
    let relay = Relay::started().await;
    let (id, _outbound) = relay.connect();
    relay.viewers.request_view(&id, "v=0").await.unwrap();

    let err = relay.viewers.request_view(&id, "v=0 again").await.unwrap_err();

    assert!(matches!(err, Error::AlreadyViewing));
    assert!(err.to_string().contains("already viewing"));
    let endpoints = relay.engine.webrtc_endpoints();
    assert_eq!(endpoints.len(), 1);
    assert!(!endpoints[0].is_released());
    assert!(relay.registry.is_bound(&id, endpoints[0].id()));
    assert_eq!(relay.engine.players()[0].sinks(), vec![endpoints[0].id().to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_joins_on_one_session() {
    let relay = Relay::started().await;
    relay.engine.delay(MockOp::CreateWebRtcEndpoint, Duration::from_millis(100));
    let (id, _outbound) = relay.connect();

    let (a, b) = futures::future::join(
        relay.viewers.request_view(&id, "v=0"),
        relay.viewers.request_view(&id, "v=0"),
    )
    .await;

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    assert!(matches!(a.err().or(b.err()), Some(Error::AlreadyViewing)));
    assert_eq!(relay.engine.webrtc_endpoints().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_join_cannot_tear_down_reused_session() {
    let relay = Relay::started().await;
    relay.engine.delay(MockOp::ProcessOffer, Duration::from_millis(100));
    let (id, _first) = relay.connect();

    let stale = {
        let viewers = Arc::clone(&relay.viewers);
        let id = id.clone();
        tokio::spawn(async move { viewers.request_view(&id, "v=0").await })
    };
    settle().await;
    // First connection goes away mid-offer and the id is handed out again
    relay.registry.remove(&id).await;
    let (reused, _second) = relay.connect();
    assert_eq!(reused, id);

    let current = {
        let viewers = Arc::clone(&relay.viewers);
        let id = id.clone();
        tokio::spawn(async move { viewers.request_view(&id, "v=0").await })
    };

    assert!(stale.await.unwrap().is_err());
    assert!(current.await.unwrap().is_ok());

    let endpoints = relay.engine.webrtc_endpoints();
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints[0].is_released());
    assert!(!endpoints[1].is_released());
    assert!(relay.registry.is_bound(&id, endpoints[1].id()));
    assert_eq!(relay.registry.stats().viewers, 1);
    assert_eq!(relay.engine.players()[0].sinks(), vec![endpoints[1].id().to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_join_cannot_bind_reused_session() {
    let relay = Relay::started().await;
    relay.engine.delay(MockOp::CreateWebRtcEndpoint, Duration::from_millis(100));
    let (id, _first) = relay.connect();

    let stale = {
        let viewers = Arc::clone(&relay.viewers);
        let id = id.clone();
        tokio::spawn(async move { viewers.request_view(&id, "v=0").await })
    };
    settle().await;
    relay.registry.remove(&id).await;
    let (reused, _second) = relay.connect();
    assert_eq!(reused, id);

    // Claims the reused id while the stale endpoint is still being created
    let current = {
        let viewers = Arc::clone(&relay.viewers);
        let id = id.clone();
        tokio::spawn(async move { viewers.request_view(&id, "v=0").await })
    };

    assert!(matches!(stale.await.unwrap(), Err(Error::SessionClosed(_))));
    assert!(current.await.unwrap().is_ok());

    let endpoints = relay.engine.webrtc_endpoints();
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints[0].is_released());
    assert!(!endpoints[1].is_released());
    assert!(relay.registry.is_bound(&id, endpoints[1].id()));
    assert_eq!(relay.engine.players()[0].sinks(), vec![endpoints[1].id().to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_join_without_ingest_rejected() {
    let relay = Relay::new();
    let (id, _outbound) = relay.connect();

    let err = relay.viewers.request_view(&id, "v=0").await.unwrap_err();

    assert!(matches!(err, Error::NoActiveStream));
    assert_eq!(err.to_string(), "No active streams available. Try again later");
    assert!(relay.engine.webrtc_endpoints().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_endpoint_creation() {
    let relay = Relay::started().await;
    relay.engine.delay(MockOp::CreateWebRtcEndpoint, Duration::from_millis(100));
    let (id, _outbound) = relay.connect();

    let join = {
        let viewers = Arc::clone(&relay.viewers);
        let id = id.clone();
        tokio::spawn(async move { viewers.request_view(&id, "v=0").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    relay.ingest.stop().await;

    assert!(matches!(join.await.unwrap(), Err(Error::NoActiveStream)));
    assert!(relay.engine.webrtc_endpoints().is_empty());
    assert!(relay.registry.lookup(&id).unwrap().endpoint.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_negotiation_releases_endpoint() {
    let relay = Relay::started().await;
    relay.engine.delay(MockOp::ProcessOffer, Duration::from_millis(100));
    let (id, _outbound) = relay.connect();

    let join = {
        let viewers = Arc::clone(&relay.viewers);
        let id = id.clone();
        tokio::spawn(async move { viewers.request_view(&id, "v=0").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    relay.ingest.stop().await;

    assert!(matches!(join.await.unwrap(), Err(Error::NoActiveStream)));
    assert!(relay.engine.webrtc_endpoints()[0].is_released());
    assert_eq!(relay.registry.stats().viewers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_end_of_stream_reconnects_once_and_rebinds() {
    let relay = Relay::started().await;
    let first = relay.join().await;
    let second = relay.join().await;
    let mut endpoints: Vec<String> = relay
        .engine
        .webrtc_endpoints()
        .iter()
        .map(|e| e.id().to_string())
        .collect();
    endpoints.sort();

    let original = Arc::clone(&relay.engine.players()[0]);
    assert_eq!(original.emit(MediaEvent::EndOfStream), 1);
    settle().await;

    let players = relay.engine.players();
    assert_eq!(players.len(), 2);
    assert!(original.is_stopped());
    assert!(original.is_released());
    assert!(players[1].is_playing());
    let mut rebound = players[1].sinks();
    rebound.sort();
    assert_eq!(rebound, endpoints);

    assert_eq!(relay.ingest.state(), IngestState::Playing);
    assert_eq!(relay.ingest.reconnect_count(), 1);
    assert_eq!(relay.engine.webrtc_endpoints().len(), 2);
    assert!(relay.registry.lookup(&first).unwrap().endpoint.is_some());
    assert!(relay.registry.lookup(&second).unwrap().endpoint.is_some());

    // A late event from the replaced endpoint changes nothing
    original.emit(MediaEvent::EndOfStream);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(relay.engine.players().len(), 2);
    assert_eq!(relay.ingest.reconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_position_reconnects() {
    let relay = Relay::started().await;
    relay.join().await;
    let original = Arc::clone(&relay.engine.players()[0]);

    original.set_position(0);
    tokio::time::sleep(Duration::from_millis(1010)).await;

    let players = relay.engine.players();
    assert_eq!(players.len(), 2);
    assert!(original.is_released());
    assert_eq!(players[1].sinks(), vec![relay.engine.webrtc_endpoints()[0].id().to_string()]);
    assert_eq!(relay.ingest.reconnect_count(), 1);

    // The replacement reports progress and is kept
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(relay.engine.players().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_advancing_position_keeps_ingest() {
    let relay = Relay::started().await;

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(relay.engine.players().len(), 1);
    assert_eq!(relay.ingest.reconnect_count(), 0);
    assert_eq!(
        relay.engine.players()[0].subscriber_count(EventKind::EndOfStream),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_rebind_tears_down_only_that_viewer() {
    let relay = Relay::started().await;
    relay.join().await;
    relay.join().await;

    relay.engine.fail_times(MockOp::ConnectSink, 1);
    relay.engine.players()[0].emit(MediaEvent::EndOfStream);
    settle().await;

    assert_eq!(relay.registry.stats().viewers, 1);
    assert_eq!(relay.registry.len(), 2);
    let released = relay
        .engine
        .webrtc_endpoints()
        .iter()
        .filter(|e| e.is_released())
        .count();
    assert_eq!(released, 1);
    assert_eq!(relay.engine.players()[1].sinks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_retries_then_fails() {
    let relay = Relay::started().await;
    let viewer = relay.join().await;
    let mut state = relay.ingest.subscribe_state();

    relay.engine.fail(MockOp::CreatePlayer);
    relay.engine.players()[0].emit(MediaEvent::EndOfStream);

    let failed = tokio::time::timeout(
        Duration::from_secs(120),
        state.wait_for(|s| *s == IngestState::Failed),
    )
    .await
    .is_ok();
    assert!(failed);
    assert_eq!(relay.engine.players().len(), 1);
    assert_eq!(relay.ingest.reconnect_count(), 0);
    // Viewers are kept until shutdown
    assert!(relay.registry.contains(&viewer));

    let (id, _outbound) = relay.connect();
    assert!(matches!(
        relay.viewers.request_view(&id, "v=0").await,
        Err(Error::NoActiveStream)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_after_transient_failure() {
    let relay = Relay::started().await;
    relay.join().await;

    relay.engine.fail_times(MockOp::CreatePlayer, 2);
    relay.engine.players()[0].emit(MediaEvent::EndOfStream);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(relay.ingest.state(), IngestState::Reconnecting);

    let mut state = relay.ingest.subscribe_state();
    tokio::time::timeout(Duration::from_secs(30), state.wait_for(|s| *s == IngestState::Playing))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relay.ingest.reconnect_count(), 1);
    assert_eq!(relay.engine.players()[1].sinks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_during_reconnect_is_bound_by_rebind() {
    let relay = Relay::started().await;
    relay.engine.delay(MockOp::CreatePlayer, Duration::from_millis(200));
    relay.engine.players()[0].emit(MediaEvent::EndOfStream);
    settle().await;
    assert_eq!(relay.ingest.state(), IngestState::Reconnecting);

    let id = relay.join().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let endpoint = relay.registry.lookup(&id).unwrap().endpoint.unwrap();
    assert_eq!(relay.engine.players()[1].sinks(), vec![endpoint.id().to_string()]);
}

/// Drive a signaling loop for a new connection from a channel of frames
fn open(relay: &Relay) -> (SessionId, mpsc::UnboundedSender<Inbound>, tokio::task::JoinHandle<()>) {
    let conn = relay.signaling.accept();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut stream = ChannelStream(rx);
    let signaling = Arc::clone(&relay.signaling);
    let session_id = conn.session_id.clone();
    let task = tokio::spawn(async move {
        let _outbound = conn.outbound;
        signaling.run(conn.session_id, conn.handle, &mut stream).await;
    });
    (session_id, tx, task)
}

#[tokio::test(start_paused = true)]
async fn test_connection_close_releases_session() {
    let relay = Relay::started().await;
    let (viewer, viewer_tx, viewer_task) = open(&relay);
    let (pending, pending_tx, pending_task) = open(&relay);

    viewer_tx
        .send(Inbound::Text(r#"{"id":"viewer","sdpOffer":"v=0"}"#.to_string()))
        .unwrap();
    let early = serde_json::json!({"id": "onIceCandidate", "candidate": candidate(1)});
    pending_tx.send(Inbound::Text(early.to_string())).unwrap();
    settle().await;
    assert_eq!(relay.registry.stats().viewers, 1);
    assert_eq!(relay.registry.queued_candidates(&pending), 1);

    viewer_tx.send(Inbound::Close).unwrap();
    drop(pending_tx);
    viewer_task.await.unwrap();
    pending_task.await.unwrap();

    assert!(relay.engine.webrtc_endpoints()[0].is_released());
    assert_eq!(relay.registry.queued_candidates(&pending), 0);
    assert!(relay.registry.is_empty());
    assert!(!relay.registry.remove(&viewer).await);
    assert!(!relay.registry.remove(&pending).await);
}

#[tokio::test(start_paused = true)]
async fn test_signaling_round_trip() {
    let relay = Relay::started().await;
    let mut conn = relay.signaling.accept();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut stream = ChannelStream(rx);

    let session_id = conn.session_id.clone();
    let task = {
        let signaling = Arc::clone(&relay.signaling);
        let handle = conn.handle.clone();
        tokio::spawn(async move { signaling.run(session_id, handle, &mut stream).await })
    };

    let viewer_candidate = serde_json::json!({
        "id": "onIceCandidate",
        "candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
    });
    tx.send(Inbound::Text(viewer_candidate.to_string())).unwrap();
    tx.send(Inbound::Text(r#"{"id":"viewer","sdpOffer":"v=0"}"#.to_string()))
        .unwrap();
    settle().await;

    let endpoint = Arc::clone(&relay.engine.webrtc_endpoints()[0]);
    assert_eq!(
        conn.outbound.recv().await,
        Some(Outbound::Message(ServerMessage::accepted(format!(
            "answer-from-{}",
            endpoint.id()
        ))))
    );
    assert_eq!(endpoint.candidates(), vec![IceCandidate::new("candidate:1", "0", 0)]);
    assert!(endpoint.is_gathering());

    endpoint.emit(MediaEvent::IceCandidate(candidate(7)));
    assert_eq!(
        conn.outbound.recv().await,
        Some(Outbound::Message(ServerMessage::IceCandidate {
            candidate: candidate(7)
        }))
    );

    tx.send(Inbound::Text(r#"{"id":"viewer","sdpOffer":"v=0"}"#.to_string()))
        .unwrap();
    settle().await;
    match conn.outbound.recv().await {
        Some(Outbound::Message(ServerMessage::ViewerResponse { message, .. })) => {
            assert!(message.unwrap_or_default().starts_with("You are already viewing"));
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    drop(tx);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything_and_is_idempotent() {
    let relay = Relay::started().await;
    relay.join().await;
    relay.join().await;
    relay.engine.fail(MockOp::Release);

    assert_eq!(relay.shutdown.shutdown().await, 2);

    assert!(relay.registry.is_empty());
    assert!(relay.engine.pipelines()[0].is_released());
    assert_eq!(relay.ingest.state(), IngestState::Stopped);
    assert!(relay.ingest.active_player().is_none());

    assert_eq!(relay.shutdown.shutdown().await, 0);
    assert!(relay.shutdown.is_shutting_down());

    // No reconnect after shutdown
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(relay.engine.players().len(), 1);
}
