use std::collections::HashMap;
use std::sync::Arc;

use ::webrtc::api::APIBuilder;
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{
    MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9, MediaEngine,
};
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::signaling_state::RTCSignalingState;
use ::webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use ::webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use ::webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use ::webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use ::webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use ::webrtc::track::track_remote::TrackRemote;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    CodecCapability, ConnectionEvent, ConnectionFactory, ConnectionState, MediaConnection,
    SignalingState,
};
use crate::config::{CallConfig, IceServer};
use crate::error::ConnectionError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Builds peer connections on the `webrtc` crate.
#[derive(Debug, Default, Clone)]
pub struct WebRtcConnectionFactory;

impl WebRtcConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

/// Video codecs in registration order. H.264 deliberately does not come
/// first so an explicit preference is observable in the offer.
fn video_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        },
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP9.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: "profile-id=0".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 98,
            ..Default::default()
        },
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 102,
            ..Default::default()
        },
    ]
}

fn audio_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        payload_type: 111,
        ..Default::default()
    }]
}

fn ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn platform(err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Platform(err.to_string())
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn to_capability(params: &RTCRtpCodecParameters) -> CodecCapability {
    CodecCapability {
        mime_type: params.capability.mime_type.clone(),
        clock_rate: params.capability.clock_rate,
        channels: params.capability.channels,
        sdp_fmtp_line: params.capability.sdp_fmtp_line.clone(),
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, String> {
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(|err| err.to_string())
}

fn from_rtc_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer | RTCSdpType::Pranswer => SdpType::Answer,
        RTCSdpType::Rollback | RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        config: &CallConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError> {
        Ok(Arc::new(WebRtcConnection::open(config, events).await?))
    }
}

impl WebRtcConnection {
    async fn open(
        config: &CallConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self, ConnectionError> {
        let video = video_codecs();
        let audio = audio_codecs();

        let mut media_engine = MediaEngine::default();
        for params in &video {
            media_engine
                .register_codec(params.clone(), RTPCodecType::Video)
                .map_err(|err| ConnectionError::Create(err.to_string()))?;
        }
        for params in &audio {
            media_engine
                .register_codec(params.clone(), RTPCodecType::Audio)
                .map_err(|err| ConnectionError::Create(err.to_string()))?;
        }
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| ConnectionError::Create(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&config.ice_servers),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| ConnectionError::Create(err.to_string()))?,
        );
        let id = format!("pc-{}", Uuid::new_v4());
        install_callbacks(&peer_connection, &id, events);
        debug!(target: "call::webrtc", pc = %id, ice_servers = config.ice_servers.len(), "peer connection created");

        Ok(WebRtcConnection {
            id: id.clone(),
            stream_id: id,
            peer_connection,
            video_codecs: video,
            audio_codecs: audio,
            transceivers: Mutex::new(HashMap::new()),
            senders: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
        })
    }
}

fn install_callbacks(
    peer_connection: &Arc<RTCPeerConnection>,
    id: &str,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let negotiation_tx = events.clone();
    peer_connection.on_negotiation_needed(Box::new(move || {
        let _ = negotiation_tx.send(ConnectionEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let candidate_tx = events.clone();
    let candidate_pc = id.to_string();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let _ = candidate_tx.send(ConnectionEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => {
                    warn!(target: "call::webrtc", pc = %candidate_pc, error = %err, "failed to serialise local candidate")
                }
            }
        }
        Box::pin(async {})
    }));

    let state_tx = events.clone();
    let state_pc = id.to_string();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            trace!(target: "call::webrtc", pc = %state_pc, ?state, "peer connection state");
            if let Some(mapped) = map_connection_state(state) {
                let _ = state_tx.send(ConnectionEvent::StateChange(mapped));
            }
            Box::pin(async {})
        },
    ));

    let track_tx = events;
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                RTPCodecType::Unspecified => None,
            };
            if let Some(kind) = kind {
                let _ = track_tx.send(ConnectionEvent::Track(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                }));
            }
            Box::pin(async {})
        },
    ));
}

struct WebRtcConnection {
    id: String,
    stream_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    video_codecs: Vec<RTCRtpCodecParameters>,
    audio_codecs: Vec<RTCRtpCodecParameters>,
    transceivers: Mutex<HashMap<TrackKind, Arc<RTCRtpTransceiver>>>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    /// Outgoing sample tracks keyed by local track id.
    outgoing: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcConnection {
    fn registered(&self, kind: TrackKind) -> &[RTCRtpCodecParameters] {
        match kind {
            TrackKind::Audio => &self.audio_codecs,
            TrackKind::Video => &self.video_codecs,
        }
    }

    /// The sample track that carries `track` on the wire, created on first use.
    fn outgoing_track(&self, track: &LocalTrack) -> Result<Arc<TrackLocalStaticSample>, ConnectionError> {
        if let Some(existing) = self.outgoing.lock().get(track.id()) {
            return Ok(Arc::clone(existing));
        }
        let capability = self
            .registered(track.kind())
            .last()
            .map(|params| params.capability.clone())
            .ok_or_else(|| ConnectionError::Track(format!("no {} codec registered", track.kind())))?;
        let sample = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            self.stream_id.clone(),
        ));
        self.outgoing
            .lock()
            .insert(track.id().to_string(), Arc::clone(&sample));
        Ok(sample)
    }
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.peer_connection.connection_state()).unwrap_or_default()
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), ConnectionError> {
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendrecv,
            send_encodings: vec![],
        };
        let transceiver = match track {
            Some(track) => {
                let sample = self.outgoing_track(track)?;
                self.peer_connection
                    .add_transceiver_from_track(sample as Arc<dyn TrackLocal + Send + Sync>, Some(init))
                    .await
            }
            None => {
                self.peer_connection
                    .add_transceiver_from_kind(codec_type(kind), Some(init))
                    .await
            }
        }
        .map_err(|err| ConnectionError::Track(err.to_string()))?;
        let sender = transceiver.sender().await;
        self.senders.lock().insert(kind, sender);
        self.transceivers.lock().insert(kind, transceiver);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), ConnectionError> {
        let sample = self.outgoing_track(track)?;
        let sender = self
            .peer_connection
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| ConnectionError::Track(err.to_string()))?;
        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    fn codec_capabilities(&self, kind: TrackKind) -> Vec<CodecCapability> {
        self.registered(kind).iter().map(to_capability).collect()
    }

    async fn set_codec_preferences(
        &self,
        kind: TrackKind,
        codecs: Vec<CodecCapability>,
    ) -> Result<(), ConnectionError> {
        let transceiver = self
            .transceivers
            .lock()
            .get(&kind)
            .cloned()
            .ok_or_else(|| ConnectionError::Track(format!("no {kind} transceiver")))?;
        let registered = self.registered(kind);
        let ordered: Vec<RTCRtpCodecParameters> = codecs
            .iter()
            .filter_map(|codec| {
                registered.iter().find(|params| {
                    params.capability.mime_type.eq_ignore_ascii_case(&codec.mime_type)
                        && params.capability.sdp_fmtp_line == codec.sdp_fmtp_line
                })
            })
            .cloned()
            .collect();
        transceiver.set_codec_preferences(ordered).await.map_err(platform)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ConnectionError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .peer_connection
            .create_offer(Some(options))
            .await
            .map_err(|err| ConnectionError::Offer(err.to_string()))?;
        from_rtc_description(offer).ok_or_else(|| ConnectionError::Offer("unexpected sdp type".into()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| ConnectionError::Answer(err.to_string()))?;
        from_rtc_description(answer).ok_or_else(|| ConnectionError::Answer("unexpected sdp type".into()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        let description = to_rtc_description(description).map_err(ConnectionError::LocalDescription)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|err| ConnectionError::LocalDescription(err.to_string()))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        if description.is_offer() && self.signaling_state() == SignalingState::HaveLocalOffer {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.peer_connection
                .set_local_description(rollback)
                .await
                .map_err(|err| ConnectionError::RemoteDescription(format!("rollback failed: {err}")))?;
            debug!(target: "call::webrtc", pc = %self.id, "rolled back local offer");
        }
        let description = to_rtc_description(description).map_err(ConnectionError::RemoteDescription)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|err| ConnectionError::RemoteDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| ConnectionError::Candidate(err.to_string()))
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<bool, ConnectionError> {
        let Some(sender) = self.senders.lock().get(&kind).cloned() else {
            return Ok(false);
        };
        let previous = sender.track().await.map(|sent| sent.id().to_owned());
        let sample = self.outgoing_track(track)?;
        sender
            .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|err| ConnectionError::Track(err.to_string()))?;
        if let Some(previous) = previous.filter(|previous| previous != track.id()) {
            self.outgoing.lock().remove(&previous);
        }
        Ok(true)
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            debug!(target: "call::webrtc", pc = %self.id, error = %err, "close failed");
        }
        self.outgoing.lock().clear();
        self.senders.lock().clear();
        self.transceivers.lock().clear();
    }
}
