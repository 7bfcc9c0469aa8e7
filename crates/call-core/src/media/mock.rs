use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{FacingMode, LocalMedia, LocalTrack, MediaConstraints, MediaSource, TrackKind};
use crate::error::DeviceError;

/// Produces synthetic tracks that satisfy whatever constraints are asked for.
#[derive(Default)]
pub struct SyntheticMediaSource {
    fail_next: Mutex<Option<DeviceError>>,
    fail_always: Mutex<Option<DeviceError>>,
    acquisitions: AtomicUsize,
    issued: Mutex<Vec<LocalTrack>>,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: DeviceError) -> Self {
        let source = Self::default();
        *source.fail_always.lock() = Some(error);
        source
    }

    pub fn fail_next(&self, error: DeviceError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Every track handed out so far, in order.
    pub fn issued(&self) -> Vec<LocalTrack> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, DeviceError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        if let Some(error) = self.fail_always.lock().clone() {
            return Err(error);
        }
        if constraints.audio.is_none() && constraints.video.is_none() {
            return Err(DeviceError::ConstraintsUnsatisfiable);
        }
        let serial = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        let audio = constraints
            .audio
            .as_ref()
            .map(|_| LocalTrack::new(TrackKind::Audio, format!("synthetic-mic-{serial}"), None));
        let video = constraints.video.as_ref().map(|video| {
            let label = match video.facing {
                FacingMode::User => "front",
                FacingMode::Environment => "back",
            };
            LocalTrack::new(
                TrackKind::Video,
                format!("synthetic-{label}-camera-{serial}"),
                Some(video.facing),
            )
        });
        let mut issued = self.issued.lock();
        issued.extend(audio.iter().cloned());
        issued.extend(video.iter().cloned());
        Ok(LocalMedia { audio, video })
    }
}
