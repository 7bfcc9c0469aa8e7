//! In-memory media connection for tests and the loopback demo.
//!
//! Models the parts of a peer connection the negotiation engine depends on:
//! the signaling-state machine with implicit rollback, negotiation-needed
//! events, one gathered candidate per local description, remote tracks for
//! media lines the peer advertises, and a connected transition once an
//! offer/answer exchange completes. Descriptions use a small line format
//! that only other mock connections understand.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    CodecCapability, ConnectionEvent, ConnectionFactory, ConnectionState, MediaConnection,
    SignalingState,
};
use crate::config::CallConfig;
use crate::error::ConnectionError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Scripted behaviour applied to connections at creation time.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub transceivers_supported: bool,
    pub fail_offers: usize,
    pub fail_codec_preferences: bool,
    pub fail_candidates: bool,
    pub video_codecs: Vec<CodecCapability>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            transceivers_supported: true,
            fail_offers: 0,
            fail_codec_preferences: false,
            fail_candidates: false,
            video_codecs: vec![
                CodecCapability::new("video/VP8", 90_000),
                CodecCapability::new("video/VP9", 90_000),
                CodecCapability::new("video/H264", 90_000),
            ],
        }
    }
}

/// Counters for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub offers_created: usize,
    pub answers_created: usize,
    pub ice_restart_offers: usize,
    pub local_descriptions: usize,
    pub remote_descriptions: usize,
    pub rollbacks: usize,
    pub candidates_added: usize,
    pub candidates_rejected: usize,
    pub negotiation_needed_events: usize,
    pub replaced_tracks: usize,
    pub transceivers: usize,
    pub plain_tracks: usize,
}

#[derive(Debug, Clone)]
struct MockSender {
    kind: TrackKind,
    track: Option<LocalTrack>,
    codecs: Vec<CodecCapability>,
}

struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<MockSender>,
    negotiation_needed: bool,
    negotiation_announced: bool,
    announced_remote: HashSet<String>,
    serial: u64,
    behavior: MockBehavior,
    stats: MockStats,
}

pub struct MockConnection {
    id: String,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<MockState>,
}

impl MockConnection {
    pub fn new(behavior: MockBehavior, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        let id = format!("mock-pc-{}", NEXT_CONNECTION.fetch_add(1, Ordering::SeqCst));
        Self {
            id,
            events,
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                remote: None,
                senders: Vec::new(),
                negotiation_needed: false,
                negotiation_announced: false,
                announced_remote: HashSet::new(),
                serial: 0,
                behavior,
                stats: MockStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> MockStats {
        self.state.lock().stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    /// The track currently bound to the sender of `kind`.
    pub fn sender_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|sender| sender.kind == kind)
            .and_then(|sender| sender.track.clone())
    }

    pub fn codec_order(&self, kind: TrackKind) -> Vec<String> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|sender| sender.kind == kind)
            .map(|sender| sender.codecs.iter().map(|c| c.mime_type.clone()).collect())
            .unwrap_or_default()
    }

    pub fn fail_next_offer(&self) {
        self.state.lock().behavior.fail_offers += 1;
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.state.lock().behavior.fail_candidates = fail;
    }

    /// Forces a transport state change as if ICE reported it.
    pub fn simulate_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection = state;
        self.emit(ConnectionEvent::StateChange(state));
    }

    fn emit(&self, event: ConnectionEvent) {
        trace!(target: "call::mock", pc = %self.id, ?event, "mock event");
        let _ = self.events.send(event);
    }

    fn flag_negotiation(&self, state: &mut MockState) -> bool {
        state.negotiation_needed = true;
        self.announce_negotiation(state)
    }

    fn announce_negotiation(&self, state: &mut MockState) -> bool {
        if state.negotiation_needed
            && !state.negotiation_announced
            && state.signaling == SignalingState::Stable
        {
            state.negotiation_announced = true;
            state.stats.negotiation_needed_events += 1;
            return true;
        }
        false
    }

    fn render(&self, state: &mut MockState, kind: SdpType, ice_restart: bool) -> SessionDescription {
        state.serial += 1;
        let mut sdp = format!("v=0\no=mock {} {}\n", self.id, state.serial);
        if ice_restart {
            sdp.push_str("a=ice-restart\n");
        }
        for sender in &state.senders {
            let track = sender.track.as_ref().map(LocalTrack::id).unwrap_or("-");
            let codecs = sender
                .codecs
                .iter()
                .map(|c| c.mime_type.as_str())
                .collect::<Vec<_>>()
                .join(",");
            sdp.push_str(&format!("m={} {} {}\n", sender.kind, track, codecs));
        }
        SessionDescription { kind, sdp }
    }

    fn check_open(state: &MockState) -> Result<(), ConnectionError> {
        if state.signaling == SignalingState::Closed {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    /// Sets the transport to connected once both descriptions are in place.
    fn complete_exchange(&self, state: &mut MockState) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        if state.local.is_some()
            && state.remote.is_some()
            && state.connection != ConnectionState::Connected
        {
            if state.connection != ConnectionState::Disconnected {
                events.push(ConnectionEvent::StateChange(ConnectionState::Connecting));
            }
            state.connection = ConnectionState::Connected;
            events.push(ConnectionEvent::StateChange(ConnectionState::Connected));
        }
        events
    }

    fn remote_tracks(state: &mut MockState, description: &SessionDescription) -> Vec<ConnectionEvent> {
        let stream_id = description
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix("o=mock "))
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or("remote")
            .to_string();
        let mut events = Vec::new();
        for line in description.sdp.lines() {
            let Some(media) = line.strip_prefix("m=") else {
                continue;
            };
            let mut parts = media.split_whitespace();
            let kind = match parts.next() {
                Some("audio") => TrackKind::Audio,
                Some("video") => TrackKind::Video,
                _ => continue,
            };
            let Some(track_id) = parts.next().filter(|id| *id != "-") else {
                continue;
            };
            if state.announced_remote.insert(format!("{kind}:{stream_id}")) {
                events.push(ConnectionEvent::Track(RemoteTrack {
                    id: track_id.to_string(),
                    kind,
                    stream_id: stream_id.clone(),
                }));
            }
        }
        events
    }
}

#[async_trait]
impl MediaConnection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        track: Option<&LocalTrack>,
    ) -> Result<(), ConnectionError> {
        let announce = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            if !state.behavior.transceivers_supported {
                return Err(ConnectionError::Track("transceivers not supported".into()));
            }
            let codecs = match kind {
                TrackKind::Video => state.behavior.video_codecs.clone(),
                TrackKind::Audio => vec![CodecCapability::new("audio/opus", 48_000)],
            };
            state.senders.push(MockSender {
                kind,
                track: track.cloned(),
                codecs,
            });
            state.stats.transceivers += 1;
            self.flag_negotiation(&mut state)
        };
        if announce {
            self.emit(ConnectionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), ConnectionError> {
        let announce = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            let codecs = match track.kind() {
                TrackKind::Video => state.behavior.video_codecs.clone(),
                TrackKind::Audio => vec![CodecCapability::new("audio/opus", 48_000)],
            };
            state.senders.push(MockSender {
                kind: track.kind(),
                track: Some(track.clone()),
                codecs,
            });
            state.stats.plain_tracks += 1;
            self.flag_negotiation(&mut state)
        };
        if announce {
            self.emit(ConnectionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    fn codec_capabilities(&self, kind: TrackKind) -> Vec<CodecCapability> {
        match kind {
            TrackKind::Video => self.state.lock().behavior.video_codecs.clone(),
            TrackKind::Audio => vec![CodecCapability::new("audio/opus", 48_000)],
        }
    }

    async fn set_codec_preferences(
        &self,
        kind: TrackKind,
        codecs: Vec<CodecCapability>,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.behavior.fail_codec_preferences {
            return Err(ConnectionError::Platform("codec preferences unsupported".into()));
        }
        let sender = state
            .senders
            .iter_mut()
            .find(|sender| sender.kind == kind)
            .ok_or_else(|| ConnectionError::Track(format!("no {kind} transceiver")))?;
        sender.codecs = codecs;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ConnectionError> {
        // Offer generation is asynchronous on real stacks; let other tasks run.
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.behavior.fail_offers > 0 {
            state.behavior.fail_offers -= 1;
            return Err(ConnectionError::Offer("scripted failure".into()));
        }
        if state.signaling == SignalingState::HaveRemoteOffer {
            return Err(ConnectionError::Offer("remote offer pending".into()));
        }
        state.stats.offers_created += 1;
        if ice_restart {
            state.stats.ice_restart_offers += 1;
        }
        Ok(self.render(&mut state, SdpType::Offer, ice_restart))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(ConnectionError::Answer("no remote offer to answer".into()));
        }
        state.stats.answers_created += 1;
        Ok(self.render(&mut state, SdpType::Answer, false))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        let (candidate, follow_up) = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    state.negotiation_needed = false;
                    state.negotiation_announced = false;
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (kind, current) => {
                    return Err(ConnectionError::LocalDescription(format!(
                        "cannot apply local {kind:?} in {current:?}"
                    )));
                }
            }
            let is_answer = description.kind == SdpType::Answer;
            state.local = Some(description);
            state.stats.local_descriptions += 1;
            let candidate = IceCandidate {
                candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", self.id, 50_000 + state.serial),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            };
            let mut follow_up = Vec::new();
            if is_answer {
                follow_up = self.complete_exchange(&mut state);
                if self.announce_negotiation(&mut state) {
                    follow_up.push(ConnectionEvent::NegotiationNeeded);
                }
            }
            (candidate, follow_up)
        };
        self.emit(ConnectionEvent::IceCandidate(candidate));
        for event in follow_up {
            self.emit(event);
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        let events = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            if !description.sdp.starts_with("v=0") {
                return Err(ConnectionError::RemoteDescription("malformed sdp".into()));
            }
            let mut events = Vec::new();
            match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                    // Implicit rollback of the pending local offer.
                    state.stats.rollbacks += 1;
                    state.local = None;
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (kind, current) => {
                    return Err(ConnectionError::RemoteDescription(format!(
                        "cannot apply remote {kind:?} in {current:?}"
                    )));
                }
            }
            events.extend(Self::remote_tracks(&mut state, &description));
            let is_answer = description.kind == SdpType::Answer;
            state.remote = Some(description);
            state.stats.remote_descriptions += 1;
            if is_answer {
                events.extend(self.complete_exchange(&mut state));
                if self.announce_negotiation(&mut state) {
                    events.push(ConnectionEvent::NegotiationNeeded);
                }
            }
            events
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.behavior.fail_candidates || state.remote.is_none() || candidate.candidate.is_empty() {
            state.stats.candidates_rejected += 1;
            return Err(ConnectionError::Candidate(format!(
                "cannot apply {} without matching remote description",
                candidate.candidate
            )));
        }
        state.stats.candidates_added += 1;
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<bool, ConnectionError> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let Some(sender) = state.senders.iter_mut().find(|sender| sender.kind == kind) else {
            return Ok(false);
        };
        sender.track = Some(track.clone());
        state.stats.replaced_tracks += 1;
        Ok(true)
    }

    async fn close(&self) {
        let changed = {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                false
            } else {
                state.signaling = SignalingState::Closed;
                state.connection = ConnectionState::Closed;
                true
            }
        };
        if changed {
            self.emit(ConnectionEvent::StateChange(ConnectionState::Closed));
        }
    }
}

/// Creates [`MockConnection`]s and keeps a handle to each for inspection.
#[derive(Default)]
pub struct MockConnectionFactory {
    behavior: Mutex<MockBehavior>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    fail_create: AtomicBool,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Self::default()
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        _config: &CallConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn MediaConnection>, ConnectionError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ConnectionError::Create("scripted failure".into()));
        }
        let connection = Arc::new(MockConnection::new(self.behavior.lock().clone(), events));
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (MockConnection, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MockConnection::new(MockBehavior::default(), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn remote_offer_rolls_back_local_offer() {
        let (a, _a_rx) = connection();
        let (b, _b_rx) = connection();
        let video = LocalTrack::new(TrackKind::Video, "cam", None);
        a.add_transceiver(TrackKind::Video, Some(&video)).await.unwrap();
        b.add_transceiver(TrackKind::Video, Some(&video)).await.unwrap();

        let a_offer = a.create_offer(false).await.unwrap();
        a.set_local_description(a_offer).await.unwrap();
        let b_offer = b.create_offer(false).await.unwrap();

        a.set_remote_description(b_offer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);
        assert_eq!(a.stats().rollbacks, 1);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn full_exchange_connects_and_announces_tracks() {
        let (a, mut a_rx) = connection();
        let (b, mut b_rx) = connection();
        let cam = LocalTrack::new(TrackKind::Video, "cam", None);
        a.add_transceiver(TrackKind::Video, Some(&cam)).await.unwrap();
        b.add_transceiver(TrackKind::Video, Some(&cam)).await.unwrap();
        assert_eq!(drain(&mut a_rx), vec![ConnectionEvent::NegotiationNeeded]);

        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert!(drain(&mut a_rx).iter().any(|e| matches!(e, ConnectionEvent::Track(_))));
        assert!(drain(&mut b_rx).iter().any(|e| matches!(e, ConnectionEvent::Track(_))));
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn candidates_need_a_remote_description() {
        let (a, _rx) = connection();
        let candidate = IceCandidate {
            candidate: "candidate:x".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert!(matches!(
            a.add_ice_candidate(candidate).await,
            Err(ConnectionError::Candidate(_))
        ));
        assert_eq!(a.stats().candidates_rejected, 1);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn answer_in_stable_state_is_rejected() {
        let (a, _rx) = connection();
        let err = a
            .set_remote_description(SessionDescription::answer("v=0\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::RemoteDescription(_)));
    }
}
