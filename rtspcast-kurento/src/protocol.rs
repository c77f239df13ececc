//! Kurento JSON-RPC 2.0 messages
//!
//! Requests carry the server-assigned `sessionId` once one is known.
//! Element events arrive as `onEvent` notifications:
//!
//! ```json
//! {"jsonrpc":"2.0","method":"onEvent","params":{"value":{
//!     "object":"<element id>","type":"IceCandidateFound",
//!     "data":{"source":"<element id>","type":"IceCandidateFound","candidate":{...}}}}}
//! ```

use rtspcast_core::engine::{EngineError, EventKind, MediaEvent, PlayerOptions};
use rtspcast_core::IceCandidate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, mut params: Value, session_id: Option<&str>) -> Self {
        if let (Some(session_id), Some(map)) = (session_id, params.as_object_mut()) {
            map.insert("sessionId".to_string(), Value::String(session_id.to_string()));
        }
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl From<RpcError> for EngineError {
    fn from(e: RpcError) -> Self {
        Self::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseResult {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Raw shape shared by responses and notifications
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<ResponseResult>,
    #[serde(default)]
    error: Option<RpcError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response {
        id: u64,
        result: Result<ResponseResult, RpcError>,
    },
    Event(ElementEvent),
    /// Requests from the server and events this relay does not consume
    Ignored,
}

/// An `onEvent` notification for one element
#[derive(Debug, Clone, PartialEq)]
pub struct ElementEvent {
    pub object: String,
    pub kind: EventKind,
    pub event: MediaEvent,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| EngineError::Protocol(format!("invalid frame: {e}")))?;

        if let Some(method) = raw.method {
            if method != "onEvent" {
                return Ok(Self::Ignored);
            }
            return Ok(raw
                .params
                .as_ref()
                .and_then(parse_event)
                .map_or(Self::Ignored, Self::Event));
        }

        let id = raw
            .id
            .ok_or_else(|| EngineError::Protocol("response without id".to_string()))?;
        let result = match (raw.error, raw.result) {
            (Some(error), _) => Err(error),
            (None, result) => Ok(result.unwrap_or_default()),
        };
        Ok(Self::Response { id, result })
    }
}

fn parse_event(params: &Value) -> Option<ElementEvent> {
    let value = params.get("value")?;
    let event_type = value.get("type")?.as_str()?;
    let data = value.get("data");
    let object = value
        .get("object")
        .and_then(Value::as_str)
        .or_else(|| data.and_then(|d| d.get("source")).and_then(Value::as_str))?
        .to_string();

    let (kind, event) = match event_type {
        "EndOfStream" => (EventKind::EndOfStream, MediaEvent::EndOfStream),
        // Older servers raise OnIceCandidate
        "IceCandidateFound" | "OnIceCandidate" => {
            let candidate = data?.get("candidate")?;
            let candidate: IceCandidate = serde_json::from_value(candidate.clone()).ok()?;
            (EventKind::IceCandidate, MediaEvent::IceCandidate(candidate))
        }
        _ => return None,
    };
    Some(ElementEvent { object, kind, event })
}

/// Server-side event name to subscribe to
#[must_use]
pub const fn event_type(kind: EventKind) -> &'static str {
    match kind {
        EventKind::EndOfStream => "EndOfStream",
        EventKind::IceCandidate => "IceCandidateFound",
    }
}

pub fn create_params(object_type: &str, constructor_params: Value) -> Value {
    json!({
        "type": object_type,
        "constructorParams": constructor_params,
        "properties": {},
    })
}

pub fn player_params(pipeline: &str, options: &PlayerOptions) -> Value {
    json!({
        "mediaPipeline": pipeline,
        "uri": options.uri,
        "useEncodedMedia": options.use_encoded_media,
        "networkCache": options.network_cache,
    })
}

pub fn invoke_params(object: &str, operation: &str, operation_params: Value) -> Value {
    json!({
        "object": object,
        "operation": operation,
        "operationParams": operation_params,
    })
}

pub fn subscribe_params(object: &str, kind: EventKind) -> Value {
    json!({
        "type": event_type(kind),
        "object": object,
    })
}

pub fn release_params(object: &str) -> Value {
    json!({ "object": object })
}

/// `IceCandidate` as a Kurento complex type
pub fn ice_candidate_value(candidate: &IceCandidate) -> Value {
    json!({
        "__module__": "kurento",
        "__type__": "IceCandidate",
        "candidate": candidate.candidate,
        "sdpMid": candidate.sdp_mid.clone().unwrap_or_default(),
        "sdpMLineIndex": candidate.sdp_m_line_index.unwrap_or_default(),
    })
}
