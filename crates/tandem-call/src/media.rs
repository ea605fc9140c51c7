//! Local capture seam: device tracks and the source that opens them.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_protocol::CallMode;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One captured or received media track.
///
/// `set_enabled(false)` silences/blanks the track without renegotiation;
/// `stop()` releases the underlying device.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

pub type TrackRef = Arc<dyn MediaTrack>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Audio always; video only for video calls.
    pub fn for_mode(mode: CallMode) -> Self {
        Self {
            audio: true,
            video: mode.has_video(),
        }
    }
}

/// Microphone/camera access.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn capture(&self, constraints: MediaConstraints) -> Result<Vec<TrackRef>, MediaError>;
}

/// Tracks captured for the current call.
pub struct LocalMedia {
    tracks: Vec<TrackRef>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<TrackRef>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[TrackRef] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Flip `enabled` on every track of `kind`, leaving the others alone.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// Release every device.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTrack;

    #[test]
    fn constraints_follow_mode() {
        assert_eq!(
            MediaConstraints::for_mode(CallMode::Audio),
            MediaConstraints { audio: true, video: false }
        );
        assert!(MediaConstraints::for_mode(CallMode::Video).video);
    }

    #[test]
    fn set_enabled_only_touches_kind() {
        let mic = FakeTrack::new("mic", TrackKind::Audio);
        let cam = FakeTrack::new("cam", TrackKind::Video);
        let media = LocalMedia::new(vec![mic.clone() as TrackRef, cam.clone() as TrackRef]);

        media.set_enabled(TrackKind::Audio, false);
        assert!(!mic.is_enabled());
        assert!(cam.is_enabled());

        media.stop_all();
        assert!(mic.is_stopped());
        assert!(cam.is_stopped());
    }
}
