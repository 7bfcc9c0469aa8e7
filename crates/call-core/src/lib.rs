//! Two-party video calling over a pub/sub relay.
//!
//! Responsibilities:
//! - acquiring local camera and microphone tracks
//! - deciding who offers from room membership
//! - perfect negotiation with rollback, ICE restart and a liveness deadline
//! - reporting call status and recoverable errors to the UI

pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod role;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::{CallConfig, IceServer};
pub use error::{CallError, ConnectionError, DeviceError, Severity, SignalingError};
pub use negotiation::{ConnectionHealth, EngineEvent, EnginePhase, NegotiationEngine};
pub use role::{PeerRole, RoleResolver};
pub use session::{CallSession, CallStatus, SessionEvent, SessionSnapshot, SessionState};
