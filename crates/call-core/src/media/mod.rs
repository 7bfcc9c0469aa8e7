pub mod mock;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which camera a video track captures from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }
}

impl MediaConstraints {
    /// Video from the given camera, no audio. Used for device switches.
    pub fn video_only(base: Option<&VideoConstraints>, facing: FacingMode) -> Self {
        let mut video = base.cloned().unwrap_or_default();
        video.facing = facing;
        Self {
            audio: None,
            video: Some(video),
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    facing: Option<FacingMode>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to a captured local track. Clones share the enabled/stopped flags,
/// so muting through one handle is visible to the connection's sender.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>, facing: Option<FacingMode>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                facing,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn facing(&self) -> Option<FacingMode> {
        self.inner.facing
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flips the enabled flag and returns the new value.
    pub fn toggle(&self) -> bool {
        !self.inner.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Tracks returned by one acquisition.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

/// The session's local tracks: at most one of each kind.
#[derive(Debug, Clone, Default)]
pub struct MediaTrackSet {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl MediaTrackSet {
    pub fn from_media(media: LocalMedia) -> Self {
        Self {
            audio: media.audio,
            video: media.video,
        }
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.video.iter().chain(self.audio.iter())
    }

    /// Returns the new enabled state, or `None` without an audio track.
    pub fn toggle_audio(&self) -> Option<bool> {
        self.audio.as_ref().map(LocalTrack::toggle)
    }

    pub fn toggle_video(&self) -> Option<bool> {
        self.video.as_ref().map(LocalTrack::toggle)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio.as_ref().is_some_and(LocalTrack::is_enabled)
    }

    pub fn video_enabled(&self) -> bool {
        self.video.as_ref().is_some_and(LocalTrack::is_enabled)
    }

    /// Installs a new video track and hands back the previous one.
    pub fn replace_video(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        self.video.replace(track)
    }

    pub fn stop_all(&mut self) {
        for track in self.audio.take().into_iter().chain(self.video.take()) {
            track.stop();
        }
    }
}

/// Source of local capture tracks.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, DeviceError>;
}

/// Media received from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_are_shared_between_clones() {
        let track = LocalTrack::new(TrackKind::Audio, "mic", None);
        let set = MediaTrackSet::from_media(LocalMedia {
            audio: Some(track.clone()),
            video: None,
        });
        assert_eq!(set.toggle_audio(), Some(false));
        assert!(!track.is_enabled());
        assert_eq!(set.toggle_video(), None);
        assert_eq!(set.toggle_audio(), Some(true));
        assert!(set.audio_enabled());
    }

    #[test]
    fn replace_video_returns_previous_track() {
        let front = LocalTrack::new(TrackKind::Video, "front", Some(FacingMode::User));
        let back = LocalTrack::new(TrackKind::Video, "back", Some(FacingMode::Environment));
        let mut set = MediaTrackSet::from_media(LocalMedia {
            audio: None,
            video: Some(front.clone()),
        });
        let previous = set.replace_video(back.clone()).expect("previous track");
        assert!(previous.same_track(&front));
        assert!(set.video().is_some_and(|video| video.same_track(&back)));

        set.stop_all();
        assert!(back.is_stopped());
        assert!(set.is_empty());
    }

    #[test]
    fn video_only_constraints_keep_resolution() {
        let base = VideoConstraints::default();
        let constraints = MediaConstraints::video_only(Some(&base), FacingMode::Environment);
        assert!(constraints.audio.is_none());
        let video = constraints.video.expect("video constraints");
        assert_eq!(video.facing, FacingMode::Environment);
        assert_eq!((video.ideal_width, video.ideal_height), (1280, 720));
    }
}
