pub mod local;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SignalingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpType::Offer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Payload exchanged between the two peers through the relay.
///
/// Encodes as `{"sdp": {...}}` or `{"candidate": {...}}`; `description` is
/// accepted as an alias for `sdp` on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingMessage {
    #[serde(rename = "sdp", alias = "description")]
    Description(SessionDescription),
    #[serde(rename = "candidate")]
    Candidate(IceCandidate),
}

impl SignalingMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SignalingError> {
        serde_json::to_vec(self).map_err(|err| SignalingError::Protocol(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SignalingError> {
        serde_json::from_slice(bytes).map_err(|err| SignalingError::Protocol(err.to_string()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            SignalingMessage::Description(desc) if desc.is_offer() => "offer",
            SignalingMessage::Description(_) => "answer",
            SignalingMessage::Candidate(_) => "candidate",
        }
    }
}

/// Events delivered for one room subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Opened,
    /// Occupancy at subscribe time, including the local client.
    Members(Vec<String>),
    MemberJoined(String),
    MemberLeft(String),
    Data {
        message: SignalingMessage,
        sender: String,
    },
    /// The underlying connection went away; no further events follow.
    Closed,
}

/// Entry point to the pub/sub relay.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self, channel_id: &str) -> Result<Arc<dyn SignalingConnection>, SignalingError>;
}

#[async_trait]
pub trait SignalingConnection: Send + Sync {
    /// Identity the relay assigned to this client; publishes echo back with it.
    fn client_id(&self) -> String;

    async fn subscribe(&self, room: &str) -> Result<mpsc::UnboundedReceiver<RoomEvent>, SignalingError>;

    /// Fire and forget; delivery is at most once.
    async fn publish(&self, room: &str, message: &SignalingMessage) -> Result<(), SignalingError>;

    async fn unsubscribe(&self, room: &str);

    async fn close(&self);
}
