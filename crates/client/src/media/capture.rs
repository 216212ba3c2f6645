//! Media capture collaborator
//!
//! Device capture (camera/microphone/screen selection and permission
//! prompts) lives outside this core; the orchestrator consumes it through
//! the [`MediaCapture`] trait. A denied or failed capture is fatal to the
//! join/call attempt and must be surfaced, so implementations report it as
//! an error rather than yielding an empty track set.
//!
//! [`SyntheticCapture`] is the in-repo implementation: it feeds tracks with
//! generated test signals in the spirit of a signal generator (a quiet
//! audio tone, solid video frames). The payloads are opaque test frames,
//! not decodable media; integration tests and demos run against it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::track::LocalTrack;
use crate::{Error, Result};

/// The microphone+camera track pair produced by user-media capture.
///
/// Either side may be absent when the device lacks that capability.
pub struct UserMedia {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl fmt::Debug for UserMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserMedia")
            .field("audio", &self.audio.is_some())
            .field("video", &self.video.is_some())
            .finish()
    }
}

/// Capture collaborator: the platform side of media acquisition.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Request microphone + camera capture.
    async fn user_media(&self) -> Result<UserMedia>;

    /// Request a screen-capture video track.
    async fn display_media(&self) -> Result<LocalTrack>;
}

/// Interval between synthetic audio frames.
const AUDIO_FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Interval between synthetic video frames (~30 fps).
const VIDEO_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Synthetic capture source generating test signals.
pub struct SyntheticCapture {
    deny_user_media: bool,
    deny_display_media: bool,
}

impl SyntheticCapture {
    /// A capture source that grants every request.
    pub fn new() -> Self {
        Self {
            deny_user_media: false,
            deny_display_media: false,
        }
    }

    /// A capture source that denies microphone/camera access, for
    /// exercising the capture-denial path.
    pub fn denying_user_media() -> Self {
        Self {
            deny_user_media: true,
            deny_display_media: false,
        }
    }

    /// A capture source that denies screen capture.
    pub fn denying_display_media() -> Self {
        Self {
            deny_user_media: false,
            deny_display_media: true,
        }
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn user_media(&self) -> Result<UserMedia> {
        if self.deny_user_media {
            return Err(Error::CaptureFailed("permission denied".into()));
        }

        let audio = LocalTrack::audio("mic", "local");
        let video = LocalTrack::video("camera", "local");
        audio.pump_frames(audio_frame(), AUDIO_FRAME_INTERVAL);
        video.pump_frames(video_frame(0x20), VIDEO_FRAME_INTERVAL);

        debug!("Synthetic user media acquired (audio + video)");
        Ok(UserMedia {
            audio: Some(audio),
            video: Some(video),
        })
    }

    async fn display_media(&self) -> Result<LocalTrack> {
        if self.deny_display_media {
            return Err(Error::CaptureFailed("permission denied".into()));
        }

        let screen = LocalTrack::video("screen", "local");
        screen.pump_frames(video_frame(0x7f), VIDEO_FRAME_INTERVAL);

        debug!("Synthetic display media acquired");
        Ok(screen)
    }
}

/// One 20ms frame of opaque audio payload.
fn audio_frame() -> Bytes {
    Bytes::from_static(&[0u8; 160])
}

/// One opaque video frame filled with the given byte.
fn video_frame(fill: u8) -> Bytes {
    Bytes::from(vec![fill; 1024])
}
