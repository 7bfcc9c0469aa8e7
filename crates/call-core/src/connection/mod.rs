pub mod mock;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::CallConfig;
use crate::error::ConnectionError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Aggregate transport state of a media connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
}

impl CodecCapability {
    pub fn new(mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            mime_type: mime_type.into(),
            clock_rate,
            channels: 0,
            sdp_fmtp_line: String::new(),
        }
    }
}

/// Moves every codec matching `mime_type` to the front, keeping relative
/// order otherwise. `None` when the platform does not offer that codec.
pub fn prefer_codec(codecs: &[CodecCapability], mime_type: &str) -> Option<Vec<CodecCapability>> {
    let (mut preferred, rest): (Vec<_>, Vec<_>) = codecs
        .iter()
        .cloned()
        .partition(|codec| codec.mime_type.eq_ignore_ascii_case(mime_type));
    if preferred.is_empty() {
        return None;
    }
    preferred.extend(rest);
    Some(preferred)
}

/// Callbacks raised by a media connection, delivered in order on the
/// channel handed to [`ConnectionFactory::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    StateChange(ConnectionState),
    Track(RemoteTrack),
}

/// The platform peer connection as seen by the negotiation engine.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    fn id(&self) -> &str;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    /// Adds a send/receive transceiver, optionally bound to a local track.
    async fn add_transceiver(
        &self,
        kind: TrackKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), ConnectionError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), ConnectionError>;

    fn codec_capabilities(&self, kind: TrackKind) -> Vec<CodecCapability>;

    async fn set_codec_preferences(
        &self,
        kind: TrackKind,
        codecs: Vec<CodecCapability>,
    ) -> Result<(), ConnectionError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), ConnectionError>;

    /// Applying a remote offer while a local offer is pending rolls the
    /// local offer back first.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    /// Swaps the outgoing track of the sender bound to `kind` without
    /// renegotiating. Returns `false` when no such sender exists.
    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<bool, ConnectionError>;

    async fn close(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &CallConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError>;
}
