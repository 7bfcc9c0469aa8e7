use thiserror::Error;

/// Failure to acquire local capture devices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission to use the camera or microphone was denied")]
    PermissionDenied,
    #[error("no camera or microphone was found")]
    DeviceNotFound,
    #[error("the capture device is in use by another program")]
    DeviceBusy,
    #[error("the requested media constraints cannot be satisfied")]
    ConstraintsUnsatisfiable,
    #[error("media device error: {0}")]
    Other(String),
}

impl DeviceError {
    /// Text suitable for an explicit user notification.
    pub fn user_message(&self) -> &'static str {
        match self {
            DeviceError::PermissionDenied => {
                "Allow camera and microphone access in your browser settings."
            }
            DeviceError::DeviceNotFound => "No camera or microphone found.",
            DeviceError::DeviceBusy => "The device is busy in another program.",
            DeviceError::ConstraintsUnsatisfiable => "The requested media settings are unavailable.",
            DeviceError::Other(_) => "No access to camera or microphone.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("failed to connect to signaling channel {channel}: {reason}")]
    Connect { channel: String, reason: String },
    #[error("failed to subscribe to room {room}: {reason}")]
    Subscribe { room: String, reason: String },
    #[error("publish to room {room} failed: {reason}")]
    Publish { room: String, reason: String },
    #[error("signaling channel closed")]
    Closed,
    #[error("malformed signaling message: {0}")]
    Protocol(String),
}

/// Errors raised by the platform media connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("failed to create media connection: {0}")]
    Create(String),
    #[error("failed to create offer: {0}")]
    Offer(String),
    #[error("failed to create answer: {0}")]
    Answer(String),
    #[error("failed to apply local description: {0}")]
    LocalDescription(String),
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
    #[error("failed to add ice candidate: {0}")]
    Candidate(String),
    #[error("track binding failed: {0}")]
    Track(String),
    #[error("media connection closed")]
    Closed,
    #[error("media stack error: {0}")]
    Platform(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Surfaced as a status change only.
    Warning,
    /// Reported; the call keeps running.
    Recoverable,
    /// Ends the current attempt and warrants an explicit notification.
    Fatal,
}

/// Everything a call session can surface to its host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("room is full ({occupants} participants, at most 2 allowed)")]
    RoomFull { occupants: usize },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("negotiation error: {0}")]
    Negotiation(#[from] ConnectionError),
    #[error("connection to the remote peer failed")]
    ConnectivityFailed,
    #[error("a call is already starting")]
    AlreadyStarting,
    #[error("no active call")]
    NotActive,
    #[error("camera switch failed: {0}")]
    TrackSwitch(String),
}

impl CallError {
    pub fn severity(&self) -> Severity {
        match self {
            CallError::RoomFull { .. }
            | CallError::Device(_)
            | CallError::Signaling(_)
            | CallError::ConnectivityFailed => Severity::Fatal,
            CallError::Negotiation(_) | CallError::TrackSwitch(_) => Severity::Recoverable,
            CallError::AlreadyStarting | CallError::NotActive => Severity::Warning,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            CallError::Device(err) => err.user_message().to_string(),
            CallError::RoomFull { .. } => "Room is busy (max 2 participants).".to_string(),
            CallError::Signaling(_) => "Could not connect to the signaling service.".to_string(),
            CallError::ConnectivityFailed => "Connection lost.".to_string(),
            CallError::TrackSwitch(_) => "Could not switch camera.".to_string(),
            other => other.to_string(),
        }
    }
}
