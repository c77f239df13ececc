//! Media objects backed by a Kurento connection

use async_trait::async_trait;
use rtspcast_core::engine::{
    EngineError, EngineResult, EventKind, MediaElement, MediaEngine, MediaPipeline, PlayerOptions,
    Subscription,
};
use rtspcast_core::IceCandidate;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::client::KurentoClient;
use crate::protocol;

pub struct KurentoEngine {
    client: KurentoClient,
}

impl KurentoEngine {
    #[must_use]
    pub const fn new(client: KurentoClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaEngine for KurentoEngine {
    async fn create_pipeline(&self) -> EngineResult<Arc<dyn MediaPipeline>> {
        let id = self.client.create("MediaPipeline", json!({})).await?;
        Ok(Arc::new(KurentoPipeline {
            client: self.client.clone(),
            id,
        }))
    }
}

pub struct KurentoPipeline {
    client: KurentoClient,
    id: String,
}

impl KurentoPipeline {
    fn element(&self, id: String) -> Arc<dyn MediaElement> {
        Arc::new(KurentoElement {
            client: self.client.clone(),
            id,
        })
    }
}

#[async_trait]
impl MediaPipeline for KurentoPipeline {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_player(&self, options: &PlayerOptions) -> EngineResult<Arc<dyn MediaElement>> {
        let id = self
            .client
            .create("PlayerEndpoint", protocol::player_params(&self.id, options))
            .await?;
        Ok(self.element(id))
    }

    async fn create_webrtc_endpoint(&self) -> EngineResult<Arc<dyn MediaElement>> {
        let id = self
            .client
            .create("WebRtcEndpoint", json!({ "mediaPipeline": self.id }))
            .await?;
        Ok(self.element(id))
    }

    async fn release(&self) -> EngineResult<()> {
        self.client.release(&self.id).await
    }
}

pub struct KurentoElement {
    client: KurentoClient,
    id: String,
}

impl KurentoElement {
    async fn invoke(&self, operation: &str, params: Value) -> EngineResult<Value> {
        self.client.invoke(&self.id, operation, params).await
    }
}

#[async_trait]
impl MediaElement for KurentoElement {
    fn id(&self) -> &str {
        &self.id
    }

    async fn play(&self) -> EngineResult<()> {
        self.invoke("play", json!({})).await.map(drop)
    }

    async fn stop(&self) -> EngineResult<()> {
        self.invoke("stop", json!({})).await.map(drop)
    }

    async fn release(&self) -> EngineResult<()> {
        self.client.release(&self.id).await
    }

    async fn connect(&self, sink: &dyn MediaElement) -> EngineResult<()> {
        self.invoke("connect", json!({ "sink": sink.id() })).await.map(drop)
    }

    async fn process_offer(&self, offer: &str) -> EngineResult<String> {
        match self.invoke("processOffer", json!({ "offer": offer })).await? {
            Value::String(answer) => Ok(answer),
            other => Err(EngineError::Protocol(format!("processOffer returned {other}"))),
        }
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> EngineResult<()> {
        self.invoke(
            "addIceCandidate",
            json!({ "candidate": protocol::ice_candidate_value(candidate) }),
        )
        .await
        .map(drop)
    }

    async fn gather_candidates(&self) -> EngineResult<()> {
        self.invoke("gatherCandidates", json!({})).await.map(drop)
    }

    async fn get_position(&self) -> EngineResult<i64> {
        let value = self.invoke("getPosition", json!({})).await?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|p| p as i64))
            .ok_or_else(|| EngineError::Protocol(format!("getPosition returned {value}")))
    }

    async fn subscribe(&self, kind: EventKind) -> EngineResult<Subscription> {
        self.client.subscribe(&self.id, kind).await
    }
}
