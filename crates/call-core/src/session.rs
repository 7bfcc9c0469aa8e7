//! Call lifecycle: media acquisition, room membership, one negotiation
//! engine per remote peer, and the status surfaced to the UI.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::CallConfig;
use crate::connection::{ConnectionEvent, ConnectionFactory, ConnectionState};
use crate::error::{CallError, Severity, SignalingError};
use crate::media::{FacingMode, MediaConstraints, MediaSource, MediaTrackSet, RemoteTrack, TrackKind};
use crate::negotiation::{ConnectionHealth, EngineEvent, EngineOptions, NegotiationEngine};
use crate::role::{PeerRole, RoleResolver};
use crate::signaling::{RoomEvent, SignalingChannel, SignalingConnection};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTone {
    Neutral,
    Progress,
    Healthy,
    Alert,
}

/// What the status indicator shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    AcquiringMedia,
    Connecting,
    WaitingForOffer,
    Offering,
    Connected,
    Reconnecting,
    NoRemoteMedia,
    ConnectionLost,
    PeerLeft,
    RoomFull,
    Ended,
    Error,
}

impl CallStatus {
    pub fn text(self) -> &'static str {
        match self {
            CallStatus::Idle => "Ready",
            CallStatus::AcquiringMedia => "Requesting camera and microphone",
            CallStatus::Connecting => "Connecting",
            CallStatus::WaitingForOffer => "Waiting for the other participant",
            CallStatus::Offering => "Calling",
            CallStatus::Connected => "Connected",
            CallStatus::Reconnecting => "Reconnecting",
            CallStatus::NoRemoteMedia => "No media from the other side; a TURN server may be required",
            CallStatus::ConnectionLost => "Connection lost",
            CallStatus::PeerLeft => "The other participant left",
            CallStatus::RoomFull => "Room is full",
            CallStatus::Ended => "Call ended",
            CallStatus::Error => "Error",
        }
    }

    pub fn tone(self) -> StatusTone {
        match self {
            CallStatus::Idle | CallStatus::Ended => StatusTone::Neutral,
            CallStatus::AcquiringMedia
            | CallStatus::Connecting
            | CallStatus::WaitingForOffer
            | CallStatus::Offering
            | CallStatus::Reconnecting => StatusTone::Progress,
            CallStatus::Connected => StatusTone::Healthy,
            CallStatus::NoRemoteMedia
            | CallStatus::ConnectionLost
            | CallStatus::PeerLeft
            | CallStatus::RoomFull
            | CallStatus::Error => StatusTone::Alert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(CallStatus),
    /// Needs an explicit notification, distinct from the status indicator.
    Notification(CallError),
    /// Reported for the log; the call carries on.
    Error(CallError),
    /// Remote preview binding; `None` clears it.
    RemoteMedia(Option<RemoteTrack>),
    Role(PeerRole),
}

/// Point-in-time view for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub status: CallStatus,
    pub room_key: Option<String>,
    pub role: Option<PeerRole>,
    pub connection_state: String,
    pub remote_media: bool,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
}

struct DriverHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct SessionInner {
    state: SessionState,
    /// Bumped on every start and end; async work from an older attempt
    /// compares against it before touching shared state.
    epoch: u64,
    status: CallStatus,
    tracks: MediaTrackSet,
    room_key: Option<String>,
    role: Option<PeerRole>,
    engine: Option<NegotiationEngine>,
    remote: Option<RemoteTrack>,
    connection_state: ConnectionState,
    driver: Option<DriverHandle>,
}

struct Shared {
    config: CallConfig,
    signaling: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaSource>,
    factory: Arc<dyn ConnectionFactory>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<SessionInner>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Runs `f` only if `epoch` is still the current attempt.
    fn with_current<R>(&self, epoch: u64, f: impl FnOnce(&mut SessionInner) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            trace!(target: "call::session", epoch, current = inner.epoch, "dropping stale update");
            return None;
        }
        Some(f(&mut inner))
    }

    fn set_status(&self, epoch: u64, status: CallStatus) {
        let changed = self
            .with_current(epoch, |inner| {
                let changed = inner.status != status;
                inner.status = status;
                changed
            })
            .unwrap_or(false);
        if changed {
            debug!(target: "call::session", status = status.text(), "status");
            self.emit(SessionEvent::Status(status));
        }
    }

    fn surface(&self, epoch: u64, err: CallError) {
        if self.with_current(epoch, |_| ()).is_none() {
            return;
        }
        if err.severity() == Severity::Fatal {
            warn!(target: "call::session", error = %err, "call error");
            self.emit(SessionEvent::Notification(err));
        } else {
            debug!(target: "call::session", error = %err, "recoverable call error");
            self.emit(SessionEvent::Error(err));
        }
    }
}

/// One call at a time for a page context. Owns the local media, the
/// signaling connection and the current negotiation engine.
pub struct CallSession {
    shared: Arc<Shared>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaSource>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                signaling,
                media,
                factory,
                events,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Idle,
                    epoch: 0,
                    status: CallStatus::Idle,
                    tracks: MediaTrackSet::default(),
                    room_key: None,
                    role: None,
                    engine: None,
                    remote: None,
                    connection_state: ConnectionState::New,
                    driver: None,
                }),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &CallConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn status(&self) -> CallStatus {
        self.shared.inner.lock().status
    }

    pub fn local_media(&self) -> MediaTrackSet {
        self.shared.inner.lock().tracks.clone()
    }

    /// The engine of the current peer, if one is negotiating.
    pub fn engine(&self) -> Option<NegotiationEngine> {
        self.shared.inner.lock().engine.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.inner.lock();
        SessionSnapshot {
            state: inner.state,
            status: inner.status,
            room_key: inner.room_key.clone(),
            role: inner.role,
            connection_state: inner.connection_state.as_str().to_string(),
            remote_media: inner.remote.is_some(),
            mic_enabled: inner.tracks.audio_enabled(),
            camera_enabled: inner.tracks.video_enabled(),
        }
    }

    /// Acquires local tracks for preview if none are held yet.
    pub async fn acquire_media(&self) -> Result<(), CallError> {
        if !self.shared.inner.lock().tracks.is_empty() {
            return Ok(());
        }
        let media = self.shared.media.acquire(&self.shared.config.media).await?;
        let mut inner = self.shared.inner.lock();
        if inner.tracks.is_empty() {
            inner.tracks = MediaTrackSet::from_media(media);
        } else {
            let mut surplus = MediaTrackSet::from_media(media);
            surplus.stop_all();
        }
        Ok(())
    }

    /// Starts a call in `room_name`. A call already in progress is ended
    /// first; a start already under way makes this a no-op.
    pub async fn start(&self, channel_id: &str, room_name: &str) -> Result<(), CallError> {
        let shared = &self.shared;
        let active = match shared.inner.lock().state {
            SessionState::Starting => return Err(CallError::AlreadyStarting),
            SessionState::Active => true,
            SessionState::Idle | SessionState::Ended => false,
        };
        if active {
            info!(target: "call::session", "restarting call");
            self.end().await;
        }

        let room_key = shared.config.room_key(room_name);
        let epoch = {
            let mut inner = shared.inner.lock();
            if inner.state == SessionState::Starting {
                return Err(CallError::AlreadyStarting);
            }
            inner.state = SessionState::Starting;
            inner.epoch += 1;
            inner.room_key = Some(room_key.clone());
            inner.role = None;
            inner.remote = None;
            inner.connection_state = ConnectionState::New;
            inner.epoch
        };
        info!(target: "call::session", room = %room_key, channel = channel_id, "starting call");

        shared.set_status(epoch, CallStatus::AcquiringMedia);
        if let Err(err) = self.acquire_media().await {
            return Err(self.fail_start(epoch, err));
        }

        shared.set_status(epoch, CallStatus::Connecting);
        let connection = match shared.signaling.connect(channel_id).await {
            Ok(connection) => connection,
            Err(err) => return Err(self.fail_start(epoch, err.into())),
        };
        let room_events = match connection.subscribe(&room_key).await {
            Ok(events) => events,
            Err(err) => {
                connection.close().await;
                return Err(self.fail_start(epoch, err.into()));
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            shared: Arc::clone(shared),
            epoch,
            local_id: connection.client_id(),
            connection: Arc::clone(&connection),
            room_key: room_key.clone(),
            role: None,
            remote_peer: None,
            slot: None,
        };

        let launched = shared.with_current(epoch, move |inner| {
            inner.state = SessionState::Active;
            inner.driver = Some(DriverHandle {
                shutdown: shutdown_tx,
                task: tokio::spawn(driver.run(room_events, shutdown_rx)),
            });
        });
        if launched.is_none() {
            // Ended while connecting.
            connection.unsubscribe(&room_key).await;
            connection.close().await;
            return Err(CallError::NotActive);
        }
        Ok(())
    }

    fn fail_start(&self, epoch: u64, err: CallError) -> CallError {
        let shared = &self.shared;
        let current = shared
            .with_current(epoch, |inner| {
                inner.state = SessionState::Ended;
                inner.room_key = None;
            })
            .is_some();
        if !current {
            return CallError::NotActive;
        }
        warn!(target: "call::session", error = %err, "call start failed");
        shared.set_status(epoch, CallStatus::Error);
        shared.surface(epoch, err.clone());
        err
    }

    /// Tears the call down. Safe to call repeatedly; local tracks are kept
    /// for the next call.
    pub async fn end(&self) {
        let shared = &self.shared;
        let (driver, engine, epoch) = {
            let mut inner = shared.inner.lock();
            match inner.state {
                SessionState::Idle | SessionState::Ended => return,
                SessionState::Starting | SessionState::Active => {}
            }
            inner.state = SessionState::Ended;
            inner.epoch += 1;
            inner.role = None;
            inner.remote = None;
            inner.connection_state = ConnectionState::Closed;
            (inner.driver.take(), inner.engine.take(), inner.epoch)
        };
        info!(target: "call::session", "ending call");
        if let Some(engine) = engine {
            engine.close().await;
        }
        if let Some(driver) = driver {
            let _ = driver.shutdown.send(());
            if let Err(err) = driver.task.await {
                debug!(target: "call::session", error = %err, "driver task did not finish cleanly");
            }
        }
        shared.set_status(epoch, CallStatus::Ended);
        shared.emit(SessionEvent::RemoteMedia(None));
    }

    /// Ends the call and stops the local tracks.
    pub async fn end_and_release(&self) {
        self.end().await;
        self.shared.inner.lock().tracks.stop_all();
    }

    /// Returns the new enabled state, or `None` without a microphone.
    pub fn toggle_mic(&self) -> Option<bool> {
        let enabled = self.shared.inner.lock().tracks.toggle_audio();
        debug!(target: "call::session", ?enabled, "microphone toggled");
        enabled
    }

    pub fn toggle_camera(&self) -> Option<bool> {
        let enabled = self.shared.inner.lock().tracks.toggle_video();
        debug!(target: "call::session", ?enabled, "camera toggled");
        enabled
    }

    /// Flips between front and back camera. The new track replaces the
    /// outgoing one in place; on failure the previous track stays live.
    pub async fn switch_camera(&self) -> Result<FacingMode, CallError> {
        let shared = &self.shared;
        let (facing, enabled, engine, epoch) = {
            let inner = shared.inner.lock();
            let current = inner.tracks.video();
            let facing = current
                .and_then(|video| video.facing())
                .or_else(|| shared.config.media.video.as_ref().map(|video| video.facing))
                .unwrap_or_default();
            let enabled = current.map_or(true, |video| video.is_enabled());
            (facing, enabled, inner.engine.clone(), inner.epoch)
        };
        let target = facing.flipped();
        let constraints = MediaConstraints::video_only(shared.config.media.video.as_ref(), target);

        let track = match shared.media.acquire(&constraints).await {
            Ok(media) => media.video,
            Err(err) => return Err(self.switch_failed(epoch, err.to_string())),
        };
        let Some(track) = track else {
            return Err(self.switch_failed(epoch, "no video track returned".into()));
        };
        track.set_enabled(enabled);

        if let Some(engine) = engine {
            match engine.replace_track(TrackKind::Video, &track).await {
                Ok(_) | Err(CallError::NotActive) => {}
                Err(err) => {
                    track.stop();
                    return Err(self.switch_failed(epoch, err.to_string()));
                }
            }
        }

        let previous = shared.inner.lock().tracks.replace_video(track);
        if let Some(previous) = previous {
            previous.stop();
        }
        info!(target: "call::session", facing = ?target, "camera switched");
        Ok(target)
    }

    fn switch_failed(&self, epoch: u64, reason: String) -> CallError {
        let err = CallError::TrackSwitch(reason);
        warn!(target: "call::session", error = %err, "camera switch failed");
        self.shared.surface(epoch, err.clone());
        err
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.epoch += 1;
        if let Some(driver) = inner.driver.take() {
            let _ = driver.shutdown.send(());
        }
    }
}

struct EngineSlot {
    engine: NegotiationEngine,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
}

enum Input {
    Shutdown,
    Room(Option<RoomEvent>),
    Connection(ConnectionEvent),
    Engine(EngineEvent),
}

async fn recv_from<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Event loop for one call attempt. Owns the signaling connection and the
/// current engine; exits on shutdown, on a full room or when the channel
/// goes away.
struct Driver {
    shared: Arc<Shared>,
    epoch: u64,
    local_id: String,
    connection: Arc<dyn SignalingConnection>,
    room_key: String,
    role: Option<PeerRole>,
    remote_peer: Option<String>,
    slot: Option<EngineSlot>,
}

impl Driver {
    async fn run(
        mut self,
        mut room: mpsc::UnboundedReceiver<RoomEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        debug!(target: "call::session", room = %self.room_key, peer = %self.local_id, "driver started");
        loop {
            let input = {
                let (connection_rx, engine_rx) = match self.slot.as_mut() {
                    Some(slot) => (Some(&mut slot.connection_events), Some(&mut slot.engine_events)),
                    None => (None, None),
                };
                tokio::select! {
                    biased;
                    _ = &mut shutdown => Input::Shutdown,
                    Some(event) = recv_from(engine_rx) => Input::Engine(event),
                    Some(event) = recv_from(connection_rx) => Input::Connection(event),
                    event = room.recv() => Input::Room(event),
                }
            };
            let keep_going = match input {
                Input::Shutdown => false,
                Input::Room(Some(event)) => self.on_room_event(event).await,
                Input::Room(None) => self.on_room_event(RoomEvent::Closed).await,
                Input::Connection(event) => {
                    self.on_connection_event(event);
                    true
                }
                Input::Engine(event) => {
                    self.on_engine_event(event).await;
                    true
                }
            };
            if !keep_going {
                break;
            }
        }
        self.teardown().await;
    }

    async fn on_room_event(&mut self, event: RoomEvent) -> bool {
        match event {
            RoomEvent::Opened => {
                debug!(target: "call::session", room = %self.room_key, "room opened");
                true
            }
            RoomEvent::Members(members) => {
                if self.role.is_some() {
                    return true;
                }
                match RoleResolver::resolve(&members, &self.local_id) {
                    Ok(role) => {
                        info!(target: "call::session", room = %self.room_key, role = role.as_str(), members = members.len(), "role resolved");
                        self.remote_peer = members.into_iter().find(|member| *member != self.local_id);
                        self.install_engine(role).await;
                        true
                    }
                    Err(err) => {
                        warn!(target: "call::session", room = %self.room_key, error = %err, "cannot join room");
                        self.shared.set_status(self.epoch, CallStatus::RoomFull);
                        self.shared.surface(self.epoch, err);
                        false
                    }
                }
            }
            RoomEvent::MemberJoined(member) => {
                if member == self.local_id {
                    return true;
                }
                if self.remote_peer.is_none() {
                    info!(target: "call::session", room = %self.room_key, peer = %member, "peer joined");
                    self.remote_peer = Some(member);
                    if self.slot.is_none() && self.role.is_some() {
                        // Present first, so this side answers.
                        self.install_engine(PeerRole::ANSWERER).await;
                    }
                } else {
                    debug!(target: "call::session", peer = %member, "ignoring additional member");
                }
                true
            }
            RoomEvent::MemberLeft(member) => {
                if self.remote_peer.as_deref() == Some(member.as_str()) {
                    self.on_peer_left(&member).await;
                }
                true
            }
            RoomEvent::Data { message, sender } => {
                if sender == self.local_id {
                    return true;
                }
                if self.remote_peer.is_none() {
                    self.remote_peer = Some(sender.clone());
                }
                if self.remote_peer.as_deref() != Some(sender.as_str()) {
                    debug!(target: "call::session", %sender, "ignoring message from unknown member");
                    return true;
                }
                match &self.slot {
                    Some(slot) => slot.engine.on_remote_message(message, &sender).await,
                    None => {
                        debug!(target: "call::session", %sender, kind = message.label(), "no engine for message")
                    }
                }
                true
            }
            RoomEvent::Closed => {
                warn!(target: "call::session", room = %self.room_key, "signaling channel closed");
                self.shared.set_status(self.epoch, CallStatus::Error);
                self.shared
                    .surface(self.epoch, CallError::Signaling(SignalingError::Closed));
                false
            }
        }
    }

    async fn install_engine(&mut self, role: PeerRole) {
        let shared = Arc::clone(&self.shared);
        let (connection_tx, connection_events) = mpsc::unbounded_channel();
        let connection = match shared.factory.create(&shared.config, connection_tx).await {
            Ok(connection) => connection,
            Err(err) => {
                shared.set_status(self.epoch, CallStatus::Error);
                shared.surface(self.epoch, err.into());
                return;
            }
        };
        let (engine_tx, engine_events) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(
            role,
            self.local_id.clone(),
            connection,
            engine_tx,
            EngineOptions::from(&shared.config),
        );
        self.role = Some(role);
        let tracks = shared.inner.lock().tracks.clone();
        if let Err(err) = engine.attach_media(&tracks).await {
            shared.surface(self.epoch, err);
        }
        let installed = shared.with_current(self.epoch, |inner| {
            inner.role = Some(role);
            inner.engine = Some(engine.clone());
            inner.connection_state = ConnectionState::New;
        });
        if installed.is_none() {
            engine.close().await;
            return;
        }
        shared.emit(SessionEvent::Role(role));
        let status = if role.is_offerer {
            CallStatus::Offering
        } else {
            CallStatus::WaitingForOffer
        };
        shared.set_status(self.epoch, status);
        self.slot = Some(EngineSlot {
            engine,
            connection_events,
            engine_events,
        });
    }

    async fn on_peer_left(&mut self, member: &str) {
        info!(target: "call::session", room = %self.room_key, peer = %member, "peer left");
        self.remote_peer = None;
        if let Some(slot) = self.slot.take() {
            slot.engine.close().await;
        }
        let shared = &self.shared;
        let current = shared.with_current(self.epoch, |inner| {
            inner.engine = None;
            inner.remote = None;
            inner.connection_state = ConnectionState::New;
        });
        if current.is_some() {
            shared.emit(SessionEvent::RemoteMedia(None));
            shared.set_status(self.epoch, CallStatus::PeerLeft);
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        let Some(slot) = self.slot.as_ref() else {
            return;
        };
        match event {
            ConnectionEvent::NegotiationNeeded => {
                if self.remote_peer.is_none() {
                    debug!(target: "call::session", "negotiation needed; no peer to offer to yet");
                    return;
                }
                let engine = slot.engine.clone();
                tokio::spawn(async move { engine.on_renegotiation_needed().await });
            }
            ConnectionEvent::IceCandidate(candidate) => slot.engine.on_local_candidate(candidate),
            ConnectionEvent::StateChange(state) => {
                self.shared.with_current(self.epoch, |inner| inner.connection_state = state);
                slot.engine.on_connection_state_change(state);
            }
            ConnectionEvent::Track(track) => slot.engine.on_remote_track(track),
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        let shared = Arc::clone(&self.shared);
        match event {
            EngineEvent::Signal(message) => {
                trace!(target: "call::session", kind = message.label(), room = %self.room_key, "publishing");
                if let Err(err) = self.connection.publish(&self.room_key, &message).await {
                    warn!(target: "call::session", error = %err, "publish failed");
                    shared.emit(SessionEvent::Error(err.into()));
                }
            }
            EngineEvent::RemoteTrack(track) => {
                let bind = shared
                    .with_current(self.epoch, |inner| {
                        let replace = match &inner.remote {
                            None => true,
                            Some(current) => current.kind != TrackKind::Video && track.kind == TrackKind::Video,
                        };
                        if replace {
                            inner.remote = Some(track.clone());
                        }
                        replace
                    })
                    .unwrap_or(false);
                if bind {
                    shared.emit(SessionEvent::RemoteMedia(Some(track)));
                }
                shared.set_status(self.epoch, CallStatus::Connected);
            }
            EngineEvent::Phase(phase) => {
                trace!(target: "call::session", ?phase, "engine phase");
            }
            EngineEvent::Health(health) => {
                let media_flowing = shared.inner.lock().remote.is_some();
                let status = match health {
                    ConnectionHealth::Connecting if media_flowing => None,
                    ConnectionHealth::Connecting => Some(CallStatus::Connecting),
                    ConnectionHealth::Healthy => Some(CallStatus::Connected),
                    ConnectionHealth::Degraded => Some(CallStatus::Reconnecting),
                    ConnectionHealth::Unrecoverable => Some(CallStatus::ConnectionLost),
                    ConnectionHealth::NoRemoteMedia => Some(CallStatus::NoRemoteMedia),
                    ConnectionHealth::Closed => None,
                };
                if let Some(status) = status {
                    shared.set_status(self.epoch, status);
                }
            }
            EngineEvent::Error(err) => shared.surface(self.epoch, err),
        }
    }

    async fn teardown(mut self) {
        if let Some(slot) = self.slot.take() {
            slot.engine.close().await;
        }
        self.connection.unsubscribe(&self.room_key).await;
        self.connection.close().await;
        let shared = &self.shared;
        let ended_here = shared
            .with_current(self.epoch, |inner| {
                let was_active = inner.state == SessionState::Active;
                inner.state = SessionState::Ended;
                inner.engine = None;
                inner.remote = None;
                inner.driver.take();
                was_active
            })
            .unwrap_or(false);
        if ended_here {
            shared.emit(SessionEvent::RemoteMedia(None));
        }
        debug!(target: "call::session", room = %self.room_key, "driver stopped");
    }
}
