//! HTTP surface tests: static files, probes and a real WebSocket session

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use rtspcast_api::{create_router, AppState};
use rtspcast_core::config::{MediaConfig, ServerConfig, SignalingConfig};
use rtspcast_core::engine::mock::{MockConnector, MockEngine};
use rtspcast_core::engine::MediaElement;
use rtspcast_core::{IngestManager, IngestSettings, SessionRegistry, SignalingHandler, ViewerManager};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

const INDEX_HTML: &str = "<!doctype html><title>viewer</title>";

struct TestApp {
    router: Router,
    state: AppState,
    engine: Arc<MockEngine>,
    _root: TempDir,
}

async fn setup() -> TestApp {
    let root = tempfile::tempdir().unwrap();
    let public = root.path().join("public");
    std::fs::create_dir(&public).unwrap();
    std::fs::write(public.join("index.html"), INDEX_HTML).unwrap();
    std::fs::write(root.path().join("secret.txt"), "outside the static root").unwrap();

    let engine = MockEngine::new();
    let registry = SessionRegistry::new();
    let ingest = IngestManager::new(
        MockConnector::new(Arc::clone(&engine)),
        IngestSettings::from(&MediaConfig::default()),
        Arc::clone(&registry),
    );
    ingest.start("rtsp://camera/live").await.unwrap();
    let viewers = ViewerManager::new(registry, ingest);

    let signaling_config = SignalingConfig::default();
    let signaling = SignalingHandler::new(viewers, &signaling_config);
    let state = AppState::new(signaling, &signaling_config);

    let server_config = ServerConfig {
        static_dir: public.to_string_lossy().into_owned(),
        ..ServerConfig::default()
    };
    let router = create_router(state.clone(), &server_config);

    TestApp {
        router,
        state,
        engine,
        _root: root,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, String) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_index_served_for_root() {
    let app = setup().await;

    let (status, body) = get(&app.router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, INDEX_HTML);

    let (status, body) = get(&app.router, "/index.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, INDEX_HTML);
}

#[tokio::test]
async fn test_missing_and_escaping_paths_are_not_found() {
    let app = setup().await;

    assert_eq!(get(&app.router, "/missing.js").await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(&app.router, "/%2e%2e/secret.txt").await.0, StatusCode::NOT_FOUND);
    assert_eq!(get(&app.router, "/..%2fsecret.txt").await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_favicon_has_no_content() {
    let app = setup().await;

    let (status, body) = get(&app.router, "/favicon.ico").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_health_and_status() {
    let app = setup().await;

    assert_eq!(get(&app.router, "/health").await, (StatusCode::OK, "OK".to_string()));

    let (status, body) = get(&app.router, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    let status: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status["ingest"], "playing");
    assert_eq!(status["reconnects"], 0);
    assert_eq!(status["sessions"], 0);
    assert_eq!(status["viewers"], 0);
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_websocket_signaling_session() {
    let app = setup().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    socket
        .send(Message::Text("not json".into()))
        .await
        .unwrap();
    let error = next_json(&mut socket).await;
    assert_eq!(error["id"], "error");
    assert_eq!(error["message"], "Invalid message not json");

    socket
        .send(Message::Text(r#"{"id":"viewer","sdpOffer":"v=0"}"#.into()))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["id"], "viewerResponse");
    assert_eq!(response["response"], "accepted");

    let endpoint = Arc::clone(&app.engine.webrtc_endpoints()[0]);
    assert_eq!(response["sdpAnswer"], format!("answer-from-{}", endpoint.id()));
    assert_eq!(app.state.registry.stats().viewers, 1);

    let candidate = serde_json::json!({
        "id": "onIceCandidate",
        "candidate": {"candidate": "candidate:1 1 UDP 2122 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
    });
    socket
        .send(Message::Text(candidate.to_string().into()))
        .await
        .unwrap();
    wait_for(|| endpoint.candidates().len() == 1).await;

    socket.close(None).await.unwrap();
    wait_for(|| app.state.registry.is_empty()).await;
    assert!(endpoint.is_released());
}
