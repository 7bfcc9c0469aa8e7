use std::sync::Arc;

use call_core::connection::mock::{MockBehavior, MockConnection};
use call_core::connection::{ConnectionEvent, ConnectionState, MediaConnection, SignalingState};
use call_core::media::{LocalMedia, LocalTrack, MediaTrackSet, TrackKind};
use call_core::negotiation::{ConnectionHealth, EngineEvent, EngineOptions, EnginePhase, NegotiationEngine};
use call_core::signaling::{IceCandidate, SessionDescription, SignalingMessage};
use call_core::{CallError, PeerRole};
use tokio::sync::mpsc;

struct Peer {
    id: String,
    engine: NegotiationEngine,
    connection: Arc<MockConnection>,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    /// Everything the engine emitted apart from outgoing signals.
    seen: Vec<EngineEvent>,
    /// Drops negotiation-needed events, as a peer alone in a room does.
    mute_negotiation: bool,
}

impl Peer {
    fn new(id: &str, role: PeerRole) -> Self {
        let (connection_tx, connection_events) = mpsc::unbounded_channel();
        let connection = Arc::new(MockConnection::new(MockBehavior::default(), connection_tx));
        let (engine_tx, engine_events) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(
            role,
            id,
            connection.clone() as Arc<dyn MediaConnection>,
            engine_tx,
            EngineOptions::default(),
        );
        Self {
            id: id.to_string(),
            engine,
            connection,
            connection_events,
            engine_events,
            seen: Vec::new(),
            mute_negotiation: false,
        }
    }

    async fn attach(&self) {
        let media = MediaTrackSet::from_media(LocalMedia {
            audio: Some(LocalTrack::new(TrackKind::Audio, format!("{}-mic", self.id), None)),
            video: Some(LocalTrack::new(TrackKind::Video, format!("{}-cam", self.id), None)),
        });
        self.engine.attach_media(&media).await.expect("attach media");
    }

    /// Feeds pending connection events into the engine and collects the
    /// signals it wants delivered.
    async fn step(&mut self) -> Vec<SignalingMessage> {
        while let Ok(event) = self.connection_events.try_recv() {
            match event {
                ConnectionEvent::NegotiationNeeded => {
                    if !self.mute_negotiation {
                        self.engine.on_renegotiation_needed().await;
                    }
                }
                ConnectionEvent::IceCandidate(candidate) => self.engine.on_local_candidate(candidate),
                ConnectionEvent::StateChange(state) => self.engine.on_connection_state_change(state),
                ConnectionEvent::Track(track) => self.engine.on_remote_track(track),
            }
        }
        let mut outbox = Vec::new();
        while let Ok(event) = self.engine_events.try_recv() {
            match event {
                EngineEvent::Signal(message) => outbox.push(message),
                other => self.seen.push(other),
            }
        }
        outbox
    }

    fn errors(&self) -> Vec<&CallError> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }

    fn health(&self) -> Vec<ConnectionHealth> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                EngineEvent::Health(health) => Some(*health),
                _ => None,
            })
            .collect()
    }
}

/// Relays signals between the peers until both go quiet.
async fn pump(a: &mut Peer, b: &mut Peer) {
    let mut idle = 0;
    while idle < 8 {
        let from_a = a.step().await;
        let from_b = b.step().await;
        let quiet = from_a.is_empty() && from_b.is_empty();
        for message in from_a {
            b.engine.on_remote_message(message, &a.id).await;
        }
        for message in from_b {
            a.engine.on_remote_message(message, &b.id).await;
        }
        if quiet {
            idle += 1;
            tokio::task::yield_now().await;
        } else {
            idle = 0;
        }
    }
}

fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

async fn connected_pair() -> (Peer, Peer) {
    let mut offerer = Peer::new("offerer", PeerRole::OFFERER);
    let mut answerer = Peer::new("answerer", PeerRole::ANSWERER);
    answerer.mute_negotiation = true;
    answerer.attach().await;
    offerer.attach().await;
    pump(&mut offerer, &mut answerer).await;
    (offerer, answerer)
}

#[test_timeout::tokio_timeout_test(30)]
async fn offerer_and_answerer_reach_connected() {
    let (offerer, answerer) = connected_pair().await;

    for peer in [&offerer, &answerer] {
        assert_eq!(peer.connection.signaling_state(), SignalingState::Stable, "{}", peer.id);
        assert_eq!(peer.connection.connection_state(), ConnectionState::Connected, "{}", peer.id);
        assert_eq!(peer.engine.phase(), EnginePhase::Connected, "{}", peer.id);
        assert_eq!(peer.engine.remote_tracks().len(), 2, "{}", peer.id);
        assert!(peer.errors().is_empty(), "{}: {:?}", peer.id, peer.errors());
        assert!(peer.health().contains(&ConnectionHealth::Healthy), "{}", peer.id);
    }
    assert_eq!(offerer.connection.stats().offers_created, 1);
    assert_eq!(answerer.connection.stats().offers_created, 0);
    assert_eq!(answerer.connection.stats().answers_created, 1);
    assert_eq!(offerer.connection.stats().candidates_added, 1);
    assert_eq!(answerer.connection.stats().candidates_added, 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn glare_resolves_with_the_polite_peer_yielding() {
    let mut impolite = Peer::new("impolite", PeerRole::OFFERER);
    let mut polite = Peer::new("polite", PeerRole::ANSWERER);
    impolite.attach().await;
    polite.attach().await;
    // Both announced negotiation; start both offers concurrently.
    let _ = impolite.connection_events.try_recv();
    let _ = polite.connection_events.try_recv();
    tokio::join!(
        impolite.engine.on_renegotiation_needed(),
        polite.engine.on_renegotiation_needed()
    );
    assert_eq!(impolite.connection.signaling_state(), SignalingState::HaveLocalOffer);
    assert_eq!(polite.connection.signaling_state(), SignalingState::HaveLocalOffer);

    pump(&mut impolite, &mut polite).await;

    assert_eq!(polite.connection.stats().rollbacks, 1);
    assert_eq!(impolite.connection.stats().rollbacks, 0);
    assert_eq!(polite.connection.stats().answers_created, 1);
    assert_eq!(impolite.connection.stats().answers_created, 0);
    for peer in [&impolite, &polite] {
        assert_eq!(peer.connection.signaling_state(), SignalingState::Stable, "{}", peer.id);
        assert_eq!(peer.connection.connection_state(), ConnectionState::Connected, "{}", peer.id);
        assert!(!peer.engine.state().making_offer, "{}", peer.id);
        assert!(peer.errors().is_empty(), "{}: {:?}", peer.id, peer.errors());
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn ignored_offer_is_forgotten_on_the_next_message() {
    let mut impolite = Peer::new("impolite", PeerRole::OFFERER);
    impolite.attach().await;
    impolite.step().await;
    assert_eq!(impolite.connection.signaling_state(), SignalingState::HaveLocalOffer);

    impolite
        .engine
        .on_remote_message(
            SignalingMessage::Description(SessionDescription::offer("v=0\no=mock other 1\n")),
            "other",
        )
        .await;
    assert!(impolite.engine.state().ignore_offer);
    assert_eq!(impolite.connection.stats().remote_descriptions, 0);

    impolite
        .engine
        .on_remote_message(SignalingMessage::Candidate(candidate("candidate:stale")), "other")
        .await;
    assert!(!impolite.engine.state().ignore_offer);
}

#[test_timeout::tokio_timeout_test(30)]
async fn candidates_for_an_ignored_offer_fail_silently() {
    let mut impolite = Peer::new("impolite", PeerRole::OFFERER);
    impolite.attach().await;
    impolite.step().await;

    impolite
        .engine
        .on_remote_message(
            SignalingMessage::Description(SessionDescription::offer("v=0\no=mock other 1\n")),
            "other",
        )
        .await;
    impolite
        .engine
        .on_remote_message(SignalingMessage::Candidate(candidate("candidate:stale")), "other")
        .await;
    impolite.step().await;

    assert_eq!(impolite.connection.stats().candidates_rejected, 1);
    assert!(impolite.errors().is_empty(), "{:?}", impolite.errors());
}

#[test_timeout::tokio_timeout_test(30)]
async fn unexpected_candidate_failures_are_reported() {
    let mut answerer = Peer::new("answerer", PeerRole::ANSWERER);
    answerer
        .engine
        .on_remote_message(SignalingMessage::Candidate(candidate("candidate:early")), "other")
        .await;
    answerer.step().await;

    assert!(matches!(
        answerer.errors().as_slice(),
        [CallError::Negotiation(_)]
    ));
    assert!(!answerer.engine.is_closed());
}

#[test_timeout::tokio_timeout_test(30)]
async fn concurrent_negotiation_requests_coalesce() {
    let peer = Peer::new("solo", PeerRole::OFFERER);
    peer.attach().await;
    tokio::join!(
        peer.engine.on_renegotiation_needed(),
        peer.engine.on_renegotiation_needed(),
        peer.engine.on_renegotiation_needed()
    );
    assert_eq!(peer.connection.stats().offers_created, 1);
    assert!(!peer.engine.state().making_offer);
}

#[test_timeout::tokio_timeout_test(30)]
async fn disconnect_triggers_an_ice_restart() {
    let (mut offerer, mut answerer) = connected_pair().await;
    offerer.seen.clear();

    offerer.connection.simulate_connection_state(ConnectionState::Disconnected);
    offerer.step().await;
    assert_eq!(offerer.engine.phase(), EnginePhase::Degraded);
    assert!(offerer.engine.state().pending_restart);

    pump(&mut offerer, &mut answerer).await;

    assert_eq!(offerer.connection.stats().ice_restart_offers, 1);
    assert_eq!(answerer.connection.stats().answers_created, 2);
    assert_eq!(
        offerer.health(),
        vec![ConnectionHealth::Degraded, ConnectionHealth::Healthy]
    );
    assert!(!offerer.engine.state().pending_restart);
    assert_eq!(offerer.engine.phase(), EnginePhase::Connected);
}

#[test_timeout::tokio_timeout_test(30)]
async fn replacing_a_track_does_not_renegotiate() {
    let (mut offerer, mut answerer) = connected_pair().await;
    let offers = offerer.connection.stats().offers_created;

    let back = LocalTrack::new(TrackKind::Video, "back-cam", None);
    assert!(offerer.engine.replace_track(TrackKind::Video, &back).await.unwrap());
    pump(&mut offerer, &mut answerer).await;

    let sent = offerer.connection.sender_track(TrackKind::Video).expect("video sender");
    assert!(sent.same_track(&back));
    assert_eq!(offerer.connection.stats().offers_created, offers);
    assert_eq!(offerer.engine.phase(), EnginePhase::Connected);
}

#[test_timeout::tokio_timeout_test(30)]
async fn closing_one_side_leaves_the_other_engine_usable() {
    let (mut offerer, mut answerer) = connected_pair().await;
    answerer.engine.close().await;
    pump(&mut offerer, &mut answerer).await;

    assert!(answerer.connection.is_closed());
    assert_eq!(answerer.engine.phase(), EnginePhase::Closed);
    assert!(!offerer.engine.is_closed());
    assert!(offerer.errors().is_empty());
}
