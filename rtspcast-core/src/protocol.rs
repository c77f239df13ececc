//! Viewer signaling wire protocol
//!
//! JSON objects discriminated by their `id` field:
//!
//! | Direction | id               | Fields                                     |
//! |-----------|------------------|--------------------------------------------|
//! | in        | `viewer`         | `sdpOffer`                                 |
//! | out       | `viewerResponse` | `response`, `sdpAnswer` or `message`       |
//! | in        | `onIceCandidate` | `candidate`                                |
//! | out       | `iceCandidate`   | `candidate`                                |
//! | out       | `error`          | `message`                                  |

use serde::{Deserialize, Serialize};

use crate::types::IceCandidate;

/// Messages received from a viewer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "id")]
pub enum ClientMessage {
    #[serde(rename = "viewer")]
    Viewer {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },
    #[serde(rename = "onIceCandidate")]
    OnIceCandidate { candidate: IceCandidate },
}

impl ClientMessage {
    /// Parse a text frame; anything that is not a known message is an error
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerResponse {
    Accepted,
    Rejected,
}

/// Messages sent to a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum ServerMessage {
    #[serde(rename = "viewerResponse")]
    ViewerResponse {
        response: ViewerResponse,
        #[serde(rename = "sdpAnswer", skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "iceCandidate")]
    IceCandidate { candidate: IceCandidate },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn accepted(sdp_answer: impl Into<String>) -> Self {
        Self::ViewerResponse {
            response: ViewerResponse::Accepted,
            sdp_answer: Some(sdp_answer.into()),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::ViewerResponse {
            response: ViewerResponse::Rejected,
            sdp_answer: None,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Encode for a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
