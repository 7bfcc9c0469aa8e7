//! Perfect negotiation over an unreliable signaling channel.
//!
//! Each peer runs one [`NegotiationEngine`] per call attempt. The engine is
//! fed from three directions: the media connection (negotiation needed,
//! local candidates, transport state, remote tracks), the remote peer
//! (descriptions and candidates relayed by the signaling channel) and the
//! session (track substitution, close). Everything it wants to tell the
//! outside world goes out as [`EngineEvent`]s.
//!
//! Offer collisions are settled by politeness rather than locking: the
//! impolite peer drops a colliding remote offer, the polite peer rolls its
//! own offer back and answers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::config::CallConfig;
use crate::connection::{ConnectionState, MediaConnection, SignalingState, prefer_codec};
use crate::error::{CallError, ConnectionError};
use crate::media::{LocalTrack, MediaTrackSet, RemoteTrack, TrackKind};
use crate::role::PeerRole;
use crate::signaling::{IceCandidate, SessionDescription, SignalingMessage};

static NEXT_ENGINE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub liveness_timeout: Duration,
    pub preferred_video_codec: String,
}

impl From<&CallConfig> for EngineOptions {
    fn from(config: &CallConfig) -> Self {
        Self {
            liveness_timeout: config.liveness_timeout,
            preferred_video_codec: config.preferred_video_codec.clone(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&CallConfig::default())
    }
}

/// Flags driving collision handling, plus the mirrored transport state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationState {
    pub making_offer: bool,
    pub ignore_offer: bool,
    pub connection_state: ConnectionState,
    pub pending_restart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    New,
    Negotiating,
    Stable,
    Connected,
    Degraded,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Connecting,
    Healthy,
    /// Transport dropped; an ICE restart is under way.
    Degraded,
    Unrecoverable,
    /// Nothing arrived from the peer before the liveness deadline. Usually a
    /// network that needs a TURN relay.
    NoRemoteMedia,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Message to publish to the remote peer.
    Signal(SignalingMessage),
    RemoteTrack(RemoteTrack),
    Phase(EnginePhase),
    Health(ConnectionHealth),
    Error(CallError),
}

enum Liveness {
    Idle,
    Armed(AbortHandle),
    Settled,
}

struct EngineInner {
    negotiation: NegotiationState,
    phase: EnginePhase,
    /// Set while candidates may belong to an offer this peer ignored.
    /// Cleared when the next remote description is accepted.
    stale_candidates: bool,
    liveness: Liveness,
    closed: bool,
    remote_tracks: Vec<RemoteTrack>,
    accepted_remote_offers: u64,
    negotiated_once: bool,
}

struct Shared {
    id: u64,
    role: PeerRole,
    local_id: String,
    connection: Arc<dyn MediaConnection>,
    events: mpsc::UnboundedSender<EngineEvent>,
    options: EngineOptions,
    inner: Mutex<EngineInner>,
}

enum OfferOutcome {
    Sent(SessionDescription),
    Superseded,
    Failed(ConnectionError),
}

/// Per-attempt negotiation state machine. Cheap to clone; clones drive the
/// same engine.
#[derive(Clone)]
pub struct NegotiationEngine {
    shared: Arc<Shared>,
}

impl NegotiationEngine {
    pub fn new(
        role: PeerRole,
        local_id: impl Into<String>,
        connection: Arc<dyn MediaConnection>,
        events: mpsc::UnboundedSender<EngineEvent>,
        options: EngineOptions,
    ) -> Self {
        let local_id = local_id.into();
        let id = NEXT_ENGINE.fetch_add(1, Ordering::SeqCst);
        debug!(target: "call::negotiation", engine = id, peer = %local_id, role = role.as_str(), pc = connection.id(), "engine created");
        Self {
            shared: Arc::new(Shared {
                id,
                role,
                local_id,
                connection,
                events,
                options,
                inner: Mutex::new(EngineInner {
                    negotiation: NegotiationState::default(),
                    phase: EnginePhase::New,
                    stale_candidates: false,
                    liveness: Liveness::Idle,
                    closed: false,
                    remote_tracks: Vec::new(),
                    accepted_remote_offers: 0,
                    negotiated_once: false,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn role(&self) -> PeerRole {
        self.shared.role
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn connection(&self) -> &Arc<dyn MediaConnection> {
        &self.shared.connection
    }

    pub fn state(&self) -> NegotiationState {
        self.shared.inner.lock().negotiation
    }

    pub fn phase(&self) -> EnginePhase {
        self.shared.inner.lock().phase
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.shared.inner.lock().remote_tracks.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Binds local tracks to send/receive transceivers, video first so the
    /// codec preference can be applied to it. Falls back to plain track
    /// addition when the platform refuses transceivers.
    pub async fn attach_media(&self, tracks: &MediaTrackSet) -> Result<(), CallError> {
        let connection = &self.shared.connection;
        if let Err(err) = connection.add_transceiver(TrackKind::Video, tracks.video()).await {
            debug!(target: "call::negotiation", engine = self.shared.id, error = %err, "video transceiver refused; adding tracks directly");
            for track in tracks.tracks() {
                connection.add_track(track).await?;
            }
            return Ok(());
        }
        self.apply_codec_preference().await;

        if let Err(err) = connection.add_transceiver(TrackKind::Audio, tracks.audio()).await {
            debug!(target: "call::negotiation", engine = self.shared.id, error = %err, "audio transceiver refused; adding track directly");
            if let Some(audio) = tracks.audio() {
                connection.add_track(audio).await?;
            }
        }
        Ok(())
    }

    async fn apply_codec_preference(&self) {
        let connection = &self.shared.connection;
        let preferred = &self.shared.options.preferred_video_codec;
        let available = connection.codec_capabilities(TrackKind::Video);
        match prefer_codec(&available, preferred) {
            Some(ordered) => {
                if let Err(err) = connection.set_codec_preferences(TrackKind::Video, ordered).await {
                    debug!(target: "call::negotiation", codec = %preferred, error = %err, "codec preference not applied");
                }
            }
            None => {
                debug!(target: "call::negotiation", codec = %preferred, "preferred codec unavailable; keeping platform order")
            }
        }
    }

    /// Produces and sends a local offer unless one is already being made.
    pub async fn on_renegotiation_needed(&self) {
        let shared = &self.shared;
        let (epoch, ice_restart) = {
            let mut inner = shared.inner.lock();
            if inner.closed {
                return;
            }
            if inner.negotiation.making_offer {
                trace!(target: "call::negotiation", engine = shared.id, "offer already in flight; coalescing");
                return;
            }
            inner.negotiation.making_offer = true;
            shared.recompute_phase(&mut inner);
            (inner.accepted_remote_offers, inner.negotiation.pending_restart)
        };

        let outcome = self.make_offer(epoch, ice_restart).await;

        let mut inner = shared.inner.lock();
        inner.negotiation.making_offer = false;
        if inner.closed {
            return;
        }
        match outcome {
            OfferOutcome::Sent(offer) => {
                if ice_restart {
                    inner.negotiation.pending_restart = false;
                }
                inner.negotiated_once = true;
                debug!(target: "call::negotiation", engine = shared.id, peer = %shared.local_id, ice_restart, "sending offer");
                shared.arm_liveness(&mut inner);
                shared.emit(EngineEvent::Signal(SignalingMessage::Description(offer)));
            }
            OfferOutcome::Superseded => {
                debug!(target: "call::negotiation", engine = shared.id, "local offer superseded by remote offer");
            }
            OfferOutcome::Failed(err) => {
                warn!(target: "call::negotiation", engine = shared.id, error = %err, "offer failed");
                shared.emit(EngineEvent::Error(CallError::Negotiation(err)));
            }
        }
        shared.recompute_phase(&mut inner);
    }

    async fn make_offer(&self, epoch: u64, ice_restart: bool) -> OfferOutcome {
        let shared = &self.shared;
        let offer = match shared.connection.create_offer(ice_restart).await {
            Ok(offer) => offer,
            Err(err) => return shared.classify_offer_failure(epoch, err),
        };
        let superseded = shared.inner.lock().accepted_remote_offers != epoch;
        if superseded {
            return OfferOutcome::Superseded;
        }
        match shared.connection.set_local_description(offer.clone()).await {
            Ok(()) => OfferOutcome::Sent(offer),
            Err(err) => shared.classify_offer_failure(epoch, err),
        }
    }

    /// Applies a message relayed from the remote peer.
    pub async fn on_remote_message(&self, message: SignalingMessage, sender: &str) {
        let shared = &self.shared;
        if sender == shared.local_id {
            trace!(target: "call::negotiation", engine = shared.id, kind = message.label(), "ignoring echo of own message");
            return;
        }
        {
            let mut inner = shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.negotiation.ignore_offer = false;
        }
        match message {
            SignalingMessage::Description(description) => self.handle_description(description).await,
            SignalingMessage::Candidate(candidate) => self.handle_candidate(candidate).await,
        }
    }

    async fn handle_description(&self, description: SessionDescription) {
        let shared = &self.shared;
        let is_offer = description.is_offer();
        {
            let mut inner = shared.inner.lock();
            let collision = is_offer
                && (inner.negotiation.making_offer
                    || shared.connection.signaling_state() != SignalingState::Stable);
            inner.negotiation.ignore_offer = collision && !shared.role.is_polite();
            if inner.negotiation.ignore_offer {
                inner.stale_candidates = true;
                debug!(target: "call::negotiation", engine = shared.id, peer = %shared.local_id, "offer collision; keeping local offer");
                return;
            }
            if collision {
                debug!(target: "call::negotiation", engine = shared.id, peer = %shared.local_id, "offer collision; yielding to remote offer");
            }
            if is_offer {
                inner.accepted_remote_offers += 1;
            }
        }

        if let Err(err) = shared.connection.set_remote_description(description).await {
            shared.report(err);
            return;
        }
        {
            let mut inner = shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.stale_candidates = false;
            inner.negotiated_once = true;
            shared.recompute_phase(&mut inner);
        }
        if !is_offer {
            return;
        }

        let answer = match shared.connection.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return shared.report(err),
        };
        if let Err(err) = shared.connection.set_local_description(answer.clone()).await {
            return shared.report(err);
        }
        let mut inner = shared.inner.lock();
        if inner.closed {
            return;
        }
        debug!(target: "call::negotiation", engine = shared.id, peer = %shared.local_id, "sending answer");
        shared.arm_liveness(&mut inner);
        shared.emit(EngineEvent::Signal(SignalingMessage::Description(answer)));
        shared.recompute_phase(&mut inner);
    }

    async fn handle_candidate(&self, candidate: IceCandidate) {
        let shared = &self.shared;
        let Err(err) = shared.connection.add_ice_candidate(candidate).await else {
            return;
        };
        let stale = shared.inner.lock().stale_candidates;
        if stale {
            debug!(target: "call::negotiation", engine = shared.id, error = %err, "dropping candidate for ignored offer");
        } else {
            shared.report(err);
        }
    }

    /// Forwards a locally gathered candidate to the peer.
    pub fn on_local_candidate(&self, candidate: IceCandidate) {
        let shared = &self.shared;
        if shared.inner.lock().closed {
            return;
        }
        shared.emit(EngineEvent::Signal(SignalingMessage::Candidate(candidate)));
    }

    pub fn on_remote_track(&self, track: RemoteTrack) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if inner.closed {
            return;
        }
        shared.settle_liveness(&mut inner);
        debug!(target: "call::negotiation", engine = shared.id, kind = %track.kind, track = %track.id, "remote track");
        inner.remote_tracks.push(track.clone());
        shared.emit(EngineEvent::RemoteTrack(track));
        shared.recompute_phase(&mut inner);
    }

    /// Mirrors the transport state. A drop to `Disconnected` schedules an
    /// ICE-restart offer on the current runtime.
    pub fn on_connection_state_change(&self, state: ConnectionState) {
        let shared = &self.shared;
        let restart = {
            let mut inner = shared.inner.lock();
            if inner.closed || inner.negotiation.connection_state == state {
                return;
            }
            debug!(target: "call::negotiation", engine = shared.id, peer = %shared.local_id, state = state.as_str(), "connection state");
            inner.negotiation.connection_state = state;
            let mut restart = false;
            match state {
                ConnectionState::New => {}
                ConnectionState::Connecting => shared.emit(EngineEvent::Health(ConnectionHealth::Connecting)),
                ConnectionState::Connected => {
                    shared.settle_liveness(&mut inner);
                    inner.negotiation.pending_restart = false;
                    shared.emit(EngineEvent::Health(ConnectionHealth::Healthy));
                }
                ConnectionState::Disconnected => {
                    inner.negotiation.pending_restart = true;
                    restart = true;
                    shared.emit(EngineEvent::Health(ConnectionHealth::Degraded));
                }
                ConnectionState::Failed => {
                    warn!(target: "call::negotiation", engine = shared.id, "connection failed");
                    shared.emit(EngineEvent::Health(ConnectionHealth::Unrecoverable));
                    shared.emit(EngineEvent::Error(CallError::ConnectivityFailed));
                }
                ConnectionState::Closed => {
                    shared.settle_liveness(&mut inner);
                    shared.emit(EngineEvent::Health(ConnectionHealth::Closed));
                }
            }
            shared.recompute_phase(&mut inner);
            restart
        };
        if restart {
            debug!(target: "call::negotiation", engine = shared.id, "requesting ice restart");
            let engine = self.clone();
            tokio::spawn(async move { engine.on_renegotiation_needed().await });
        }
    }

    /// Swaps the outgoing track of `kind` in place. Does not renegotiate.
    pub async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<bool, CallError> {
        if self.is_closed() {
            return Err(CallError::NotActive);
        }
        let replaced = self.shared.connection.replace_track(kind, track).await?;
        debug!(target: "call::negotiation", engine = self.shared.id, %kind, replaced, "outgoing track replaced");
        Ok(replaced)
    }

    /// Stops the engine and closes its connection. Later input is ignored.
    pub async fn close(&self) {
        let shared = &self.shared;
        {
            let mut inner = shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.negotiation.making_offer = false;
            inner.negotiation.ignore_offer = false;
            shared.settle_liveness(&mut inner);
            shared.recompute_phase(&mut inner);
        }
        shared.connection.close().await;
        debug!(target: "call::negotiation", engine = shared.id, peer = %shared.local_id, "engine closed");
    }
}

impl Shared {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, err: ConnectionError) {
        if self.inner.lock().closed {
            return;
        }
        warn!(target: "call::negotiation", engine = self.id, error = %err, "negotiation error");
        self.emit(EngineEvent::Error(CallError::Negotiation(err)));
    }

    fn classify_offer_failure(&self, epoch: u64, err: ConnectionError) -> OfferOutcome {
        if self.inner.lock().accepted_remote_offers != epoch {
            OfferOutcome::Superseded
        } else {
            OfferOutcome::Failed(err)
        }
    }

    fn recompute_phase(&self, inner: &mut EngineInner) {
        let transport = inner.negotiation.connection_state;
        let next = if inner.closed
            || matches!(transport, ConnectionState::Failed | ConnectionState::Closed)
        {
            EnginePhase::Closed
        } else if transport == ConnectionState::Disconnected {
            EnginePhase::Degraded
        } else if inner.negotiation.making_offer
            || self.connection.signaling_state() != SignalingState::Stable
        {
            EnginePhase::Negotiating
        } else if transport == ConnectionState::Connected || !inner.remote_tracks.is_empty() {
            EnginePhase::Connected
        } else if !inner.negotiated_once {
            EnginePhase::New
        } else {
            EnginePhase::Stable
        };
        if next != inner.phase {
            trace!(target: "call::negotiation", engine = self.id, from = ?inner.phase, to = ?next, "phase");
            inner.phase = next;
            self.emit(EngineEvent::Phase(next));
        }
    }

    /// Starts the liveness deadline the first time a local description is
    /// applied. Later calls leave the timer alone.
    fn arm_liveness(self: &Arc<Self>, inner: &mut EngineInner) {
        if !matches!(inner.liveness, Liveness::Idle) {
            return;
        }
        let weak: Weak<Shared> = Arc::downgrade(self);
        let timeout = self.options.liveness_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut inner = shared.inner.lock();
            if inner.closed || !matches!(inner.liveness, Liveness::Armed(_)) {
                return;
            }
            inner.liveness = Liveness::Settled;
            warn!(target: "call::negotiation", engine = shared.id, timeout_ms = timeout.as_millis() as u64, "no remote media before deadline");
            shared.emit(EngineEvent::Health(ConnectionHealth::NoRemoteMedia));
        });
        inner.liveness = Liveness::Armed(task.abort_handle());
    }

    fn settle_liveness(&self, inner: &mut EngineInner) {
        if let Liveness::Armed(handle) = std::mem::replace(&mut inner.liveness, Liveness::Settled) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockConnection;
    use crate::connection::{ConnectionEvent, mock::MockBehavior};
    use crate::media::{LocalMedia, LocalTrack};

    fn engine(role: PeerRole) -> (NegotiationEngine, Arc<MockConnection>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let connection = Arc::new(MockConnection::new(MockBehavior::default(), conn_tx));
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(
            role,
            "local",
            connection.clone() as Arc<dyn MediaConnection>,
            tx,
            EngineOptions::default(),
        );
        (engine, connection, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn tracks() -> MediaTrackSet {
        MediaTrackSet::from_media(LocalMedia {
            audio: Some(LocalTrack::new(TrackKind::Audio, "mic", None)),
            video: Some(LocalTrack::new(TrackKind::Video, "cam", None)),
        })
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn attach_media_prefers_h264_for_video() {
        let (engine, connection, _rx) = engine(PeerRole::OFFERER);
        engine.attach_media(&tracks()).await.unwrap();
        assert_eq!(connection.codec_order(TrackKind::Video)[0], "video/H264");
        assert_eq!(connection.stats().transceivers, 2);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn refused_transceivers_fall_back_to_tracks() {
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockConnection::new(
            MockBehavior {
                transceivers_supported: false,
                ..MockBehavior::default()
            },
            conn_tx,
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(
            PeerRole::ANSWERER,
            "local",
            connection.clone() as Arc<dyn MediaConnection>,
            tx,
            EngineOptions::default(),
        );
        engine.attach_media(&tracks()).await.unwrap();
        assert_eq!(connection.stats().plain_tracks, 2);
        assert_eq!(connection.stats().transceivers, 0);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn offer_failure_is_reported_and_clears_making_offer() {
        let (engine, connection, mut rx) = engine(PeerRole::OFFERER);
        connection.fail_next_offer();
        engine.on_renegotiation_needed().await;

        assert!(!engine.state().making_offer);
        assert!(drain(&mut rx).iter().any(|e| matches!(e, EngineEvent::Error(CallError::Negotiation(_)))));
        assert!(!connection.is_closed());

        engine.on_renegotiation_needed().await;
        assert_eq!(connection.stats().offers_created, 1);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn echoed_messages_are_ignored() {
        let (engine, connection, mut rx) = engine(PeerRole::ANSWERER);
        engine
            .on_remote_message(
                SignalingMessage::Description(SessionDescription::offer("v=0\n")),
                "local",
            )
            .await;
        assert_eq!(connection.stats().remote_descriptions, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn unexpected_answer_is_a_negotiation_error() {
        let (engine, _connection, mut rx) = engine(PeerRole::OFFERER);
        engine
            .on_remote_message(
                SignalingMessage::Description(SessionDescription::answer("v=0\n")),
                "remote",
            )
            .await;
        assert!(drain(&mut rx).iter().any(|e| matches!(e, EngineEvent::Error(CallError::Negotiation(_)))));
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn close_is_idempotent_and_silences_input() {
        let (engine, connection, mut rx) = engine(PeerRole::OFFERER);
        engine.close().await;
        engine.close().await;
        assert!(connection.is_closed());
        assert_eq!(engine.phase(), EnginePhase::Closed);
        let _ = drain(&mut rx);

        engine.on_renegotiation_needed().await;
        engine.on_local_candidate(IceCandidate {
            candidate: "c".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        });
        assert!(drain(&mut rx).is_empty());
        assert!(matches!(
            engine.replace_track(TrackKind::Video, &LocalTrack::new(TrackKind::Video, "cam", None)).await,
            Err(CallError::NotActive)
        ));
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn failed_transport_is_terminal_for_the_engine() {
        let (engine, _connection, mut rx) = engine(PeerRole::OFFERER);
        engine.on_connection_state_change(ConnectionState::Failed);
        let events = drain(&mut rx);
        assert!(events.contains(&EngineEvent::Health(ConnectionHealth::Unrecoverable)));
        assert!(events.contains(&EngineEvent::Error(CallError::ConnectivityFailed)));
        assert_eq!(engine.phase(), EnginePhase::Closed);
    }
}
