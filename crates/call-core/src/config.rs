use std::env;
use std::time::Duration;

use crate::media::{FacingMode, MediaConstraints};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(15_000);
pub const DEFAULT_VIDEO_CODEC: &str = "video/H264";
/// The relay only reports membership for rooms carrying this prefix.
pub const DEFAULT_ROOM_PREFIX: &str = "observable-";
pub const MAX_PARTICIPANTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Call configuration shared by every attempt of a session.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// Wait for first remote media after the local description is applied.
    pub liveness_timeout: Duration,
    /// Mime type moved to the front of the video codec list.
    pub preferred_video_codec: String,
    pub room_prefix: String,
    pub max_participants: usize,
    pub media: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            preferred_video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            room_prefix: DEFAULT_ROOM_PREFIX.to_string(),
            max_participants: MAX_PARTICIPANTS,
            media: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    /// Load configuration from `BEACH_CALL_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(servers) = env::var("BEACH_CALL_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
        }
        if let Ok(url) = env::var("BEACH_CALL_TURN_URL") {
            config.ice_servers.push(IceServer {
                urls: vec![url],
                username: env::var("BEACH_CALL_TURN_USERNAME").ok(),
                credential: env::var("BEACH_CALL_TURN_CREDENTIAL").ok(),
            });
        }
        if env_truthy("BEACH_CALL_LOCALHOST_ONLY") {
            config.ice_servers.clear();
        }
        if let Some(ms) = env::var("BEACH_CALL_LIVENESS_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            config.liveness_timeout = Duration::from_millis(ms);
        }
        if let Ok(codec) = env::var("BEACH_CALL_VIDEO_CODEC") {
            if !codec.trim().is_empty() {
                config.preferred_video_codec = codec.trim().to_string();
            }
        }
        config
    }

    pub fn builder() -> CallConfigBuilder {
        CallConfigBuilder::default()
    }

    pub fn room_key(&self, room_name: &str) -> String {
        format!("{}{}", self.room_prefix, room_name)
    }
}

fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

#[derive(Debug, Default)]
pub struct CallConfigBuilder {
    ice_servers: Option<Vec<IceServer>>,
    liveness_timeout: Option<Duration>,
    preferred_video_codec: Option<String>,
    room_prefix: Option<String>,
    facing: Option<FacingMode>,
}

impl CallConfigBuilder {
    pub fn ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = Some(servers);
        self
    }

    pub fn add_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers
            .get_or_insert_with(|| vec![IceServer::stun(DEFAULT_STUN_SERVER)])
            .push(IceServer {
                urls: vec![url.into()],
                username: Some(username.into()),
                credential: Some(credential.into()),
            });
        self
    }

    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = Some(timeout);
        self
    }

    pub fn preferred_video_codec(mut self, mime_type: impl Into<String>) -> Self {
        self.preferred_video_codec = Some(mime_type.into());
        self
    }

    pub fn room_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.room_prefix = Some(prefix.into());
        self
    }

    pub fn facing(mut self, facing: FacingMode) -> Self {
        self.facing = Some(facing);
        self
    }

    pub fn build(self) -> CallConfig {
        let mut config = CallConfig::default();
        if let Some(servers) = self.ice_servers {
            config.ice_servers = servers;
        }
        if let Some(timeout) = self.liveness_timeout {
            config.liveness_timeout = timeout;
        }
        if let Some(codec) = self.preferred_video_codec {
            config.preferred_video_codec = codec;
        }
        if let Some(prefix) = self.room_prefix {
            config.room_prefix = prefix;
        }
        if let Some(facing) = self.facing {
            if let Some(video) = config.media.video.as_mut() {
                video.facing = facing;
            }
        }
        config
    }
}
