use std::sync::Arc;
use std::time::Duration;

use call_core::connection::mock::MockConnectionFactory;
use call_core::connection::MediaConnection;
use call_core::media::mock::SyntheticMediaSource;
use async_trait::async_trait;
use call_core::media::{FacingMode, LocalMedia, MediaConstraints, MediaSource, TrackKind};
use call_core::session::{CallSession, CallStatus, SessionEvent, SessionState};
use call_core::signaling::local::LocalSignaling;
use call_core::{CallConfig, CallError, DeviceError, PeerRole};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

const WAIT: Duration = Duration::from_secs(5);

struct Participant {
    session: CallSession,
    events: broadcast::Receiver<SessionEvent>,
    media: Arc<SyntheticMediaSource>,
    factory: Arc<MockConnectionFactory>,
}

impl Participant {
    fn new(signaling: &LocalSignaling) -> Self {
        Self::with_media(signaling, SyntheticMediaSource::new())
    }

    fn with_media(signaling: &LocalSignaling, media: SyntheticMediaSource) -> Self {
        let media = Arc::new(media);
        let factory = Arc::new(MockConnectionFactory::new());
        let session = CallSession::new(
            CallConfig::default(),
            Arc::new(signaling.clone()),
            media.clone(),
            factory.clone(),
        );
        let events = session.subscribe();
        Self {
            session,
            events,
            media,
            factory,
        }
    }

    /// Reads events until `status` shows up.
    async fn wait_for(&mut self, status: CallStatus) {
        let found = tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(SessionEvent::Status(seen)) if seen == status => return,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("session events closed"),
                }
            }
        })
        .await;
        assert!(found.is_ok(), "timed out waiting for {status:?}; now {:?}", self.session.status());
    }

    async fn wait_for_notification(&mut self) -> CallError {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(SessionEvent::Notification(err)) => return err,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("session events closed"),
                }
            }
        })
        .await
        .expect("notification")
    }

    fn offers_created(&self) -> usize {
        self.factory
            .connections()
            .iter()
            .map(|connection| connection.stats().offers_created)
            .sum()
    }
}

async fn quiesce() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn connected_pair(signaling: &LocalSignaling) -> (Participant, Participant) {
    init_tracing();
    let mut first = Participant::new(signaling);
    let mut second = Participant::new(signaling);
    first.session.start("channel-first", "lobby").await.expect("first start");
    first.wait_for(CallStatus::WaitingForOffer).await;
    second.session.start("channel-second", "lobby").await.expect("second start");
    second.wait_for(CallStatus::Connected).await;
    first.wait_for(CallStatus::Connected).await;
    quiesce().await;
    (first, second)
}

#[test_timeout::tokio_timeout_test(30)]
async fn two_participants_connect_with_one_offerer() {
    let signaling = LocalSignaling::default();
    let (first, second) = connected_pair(&signaling).await;

    let first_view = first.session.snapshot();
    let second_view = second.session.snapshot();
    assert_eq!(first_view.state, SessionState::Active);
    assert_eq!(first_view.role, Some(PeerRole::ANSWERER));
    assert_eq!(second_view.role, Some(PeerRole::OFFERER));
    assert_eq!(first_view.room_key.as_deref(), Some("observable-lobby"));
    assert!(first_view.remote_media);
    assert!(second_view.remote_media);
    assert_eq!(first.offers_created(), 0);
    assert_eq!(second.offers_created(), 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn peer_leaving_and_rejoining_reconnects() {
    let signaling = LocalSignaling::default();
    let (mut first, mut second) = connected_pair(&signaling).await;

    second.session.end().await;
    first.wait_for(CallStatus::PeerLeft).await;
    assert!(!first.session.snapshot().remote_media);
    assert_eq!(first.session.state(), SessionState::Active);

    second.session.start("channel-second", "lobby").await.expect("rejoin");
    second.wait_for(CallStatus::Connected).await;
    first.wait_for(CallStatus::Connected).await;
    assert_eq!(first.session.snapshot().role, Some(PeerRole::ANSWERER));
    assert_eq!(first.factory.connections().len(), 2);
}

#[test_timeout::tokio_timeout_test(30)]
async fn third_participant_is_turned_away() {
    let signaling = LocalSignaling::default();
    let (first, second) = connected_pair(&signaling).await;

    let mut third = Participant::new(&signaling);
    third.session.start("channel-third", "lobby").await.expect("start");
    assert_eq!(
        third.wait_for_notification().await,
        CallError::RoomFull { occupants: 3 }
    );
    assert_eq!(third.session.status(), CallStatus::RoomFull);
    assert!(third.factory.connections().is_empty());

    quiesce().await;
    assert_eq!(third.session.state(), SessionState::Ended);
    assert_eq!(first.session.status(), CallStatus::Connected);
    assert_eq!(second.session.status(), CallStatus::Connected);
}

#[test_timeout::tokio_timeout_test(30)]
async fn denied_camera_fails_the_start() {
    let signaling = LocalSignaling::default();
    let mut participant = Participant::with_media(
        &signaling,
        SyntheticMediaSource::failing(DeviceError::PermissionDenied),
    );

    let err = participant.session.start("channel", "lobby").await.unwrap_err();
    assert_eq!(err, CallError::Device(DeviceError::PermissionDenied));
    assert_eq!(
        participant.wait_for_notification().await,
        CallError::Device(DeviceError::PermissionDenied)
    );
    assert_eq!(participant.session.state(), SessionState::Ended);
    assert!(signaling.relay().members("observable-lobby").is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn muting_does_not_renegotiate() {
    let signaling = LocalSignaling::default();
    let (first, second) = connected_pair(&signaling).await;
    let offers = second.offers_created();

    assert_eq!(second.session.toggle_mic(), Some(false));
    assert_eq!(second.session.toggle_camera(), Some(false));
    quiesce().await;

    let view = second.session.snapshot();
    assert!(!view.mic_enabled);
    assert!(!view.camera_enabled);
    let connection = second.factory.last().expect("connection");
    let sent_audio = connection.sender_track(TrackKind::Audio).expect("audio sender");
    assert!(!sent_audio.is_enabled());
    assert_eq!(second.offers_created(), offers);
    assert_eq!(first.offers_created(), 0);
    assert_eq!(second.session.status(), CallStatus::Connected);

    assert_eq!(second.session.toggle_mic(), Some(true));
    assert!(sent_audio.is_enabled());
}

#[test_timeout::tokio_timeout_test(30)]
async fn switching_camera_keeps_the_call_up() {
    let signaling = LocalSignaling::default();
    let (_first, second) = connected_pair(&signaling).await;
    let offers = second.offers_created();
    let before = second.session.local_media().video().cloned().expect("camera");
    second.session.toggle_camera();

    let facing = second.session.switch_camera().await.expect("switch");
    assert_eq!(facing, FacingMode::Environment);
    quiesce().await;

    let connection = second.factory.last().expect("connection");
    let sent = connection.sender_track(TrackKind::Video).expect("video sender");
    assert_eq!(sent.facing(), Some(FacingMode::Environment));
    assert!(!sent.is_enabled(), "enabled flag carries over");
    assert!(before.is_stopped());
    assert_eq!(second.offers_created(), offers);
    assert_eq!(second.session.status(), CallStatus::Connected);
    assert_eq!(connection.connection_state().as_str(), "connected");
}

#[test_timeout::tokio_timeout_test(30)]
async fn failed_camera_switch_keeps_previous_track() {
    let signaling = LocalSignaling::default();
    let (_first, mut second) = connected_pair(&signaling).await;
    let before = second.session.local_media().video().cloned().expect("camera");

    second.media.fail_next(DeviceError::DeviceBusy);
    let err = second.session.switch_camera().await.unwrap_err();
    assert!(matches!(err, CallError::TrackSwitch(_)));

    let error = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::Error(err)) = second.events.recv().await {
                return err;
            }
        }
    })
    .await
    .expect("error event");
    assert!(matches!(error, CallError::TrackSwitch(_)));

    let current = second.session.local_media().video().cloned().expect("camera");
    assert!(current.same_track(&before));
    assert!(!before.is_stopped());
    assert_eq!(second.session.status(), CallStatus::Connected);
}

#[test_timeout::tokio_timeout_test(30)]
async fn ending_twice_is_harmless() {
    let signaling = LocalSignaling::default();
    let (_first, mut second) = connected_pair(&signaling).await;

    second.session.end().await;
    second.session.end().await;
    second.wait_for(CallStatus::Ended).await;
    quiesce().await;

    let mut extra_endings = 0;
    while let Ok(event) = second.events.try_recv() {
        if event == SessionEvent::Status(CallStatus::Ended) {
            extra_endings += 1;
        }
    }
    assert_eq!(extra_endings, 0);
    assert_eq!(second.session.state(), SessionState::Ended);
    let connection = second.factory.last().expect("connection");
    assert!(connection.is_closed());
    assert!(second.session.local_media().video().is_some(), "tracks survive end");
}

#[test_timeout::tokio_timeout_test(30)]
async fn end_and_release_stops_local_tracks() {
    let signaling = LocalSignaling::default();
    let (_first, second) = connected_pair(&signaling).await;
    let issued = second.media.issued();

    second.session.end_and_release().await;
    assert!(issued.iter().all(|track| track.is_stopped()));
    assert!(second.session.local_media().is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn starting_again_replaces_the_active_call() {
    let signaling = LocalSignaling::default();
    let (mut first, mut second) = connected_pair(&signaling).await;
    let acquisitions = second.media.acquisitions();

    second.session.start("channel-second", "lobby").await.expect("restart");
    first.wait_for(CallStatus::PeerLeft).await;
    second.wait_for(CallStatus::Connected).await;
    first.wait_for(CallStatus::Connected).await;

    assert_eq!(second.media.acquisitions(), acquisitions, "local tracks are reused");
    assert_eq!(signaling.relay().members("observable-lobby").len(), 2);
}

/// A camera that takes a moment to open.
struct SlowCamera {
    inner: SyntheticMediaSource,
    delay: Duration,
}

#[async_trait]
impl MediaSource for SlowCamera {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, DeviceError> {
        tokio::time::sleep(self.delay).await;
        self.inner.acquire(constraints).await
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn overlapping_starts_run_a_single_call() {
    let signaling = LocalSignaling::default();
    let factory = Arc::new(MockConnectionFactory::new());
    let session = CallSession::new(
        CallConfig::default(),
        Arc::new(signaling.clone()),
        Arc::new(SlowCamera {
            inner: SyntheticMediaSource::new(),
            delay: Duration::from_millis(20),
        }),
        factory.clone(),
    );
    let mut events = session.subscribe();

    let (first, second) = tokio::join!(
        session.start("channel-a", "lobby"),
        session.start("channel-b", "lobby")
    );
    assert_eq!(first, Ok(()));
    assert_eq!(second, Err(CallError::AlreadyStarting));

    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::Status(CallStatus::WaitingForOffer)) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("waiting for a peer");
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(signaling.relay().members("observable-lobby").len(), 1);
    assert_eq!(factory.connections().len(), 1);
}
