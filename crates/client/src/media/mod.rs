//! Media track controller
//!
//! Owns the local outgoing track set (microphone, camera, screen) that is
//! shared by reference across every active peer connection. Mute and
//! camera-off toggle the `enabled` flag on already-attached tracks; the
//! active video source is switched by substituting the outgoing track in
//! place on every live connection, never by renegotiating an established
//! session.

pub mod capture;
pub mod track;

pub use capture::{MediaCapture, SyntheticCapture, UserMedia};
pub use track::{LocalTrack, TrackKind};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::peer::connection::PeerConnection;
use crate::Result;

/// Controller for the local outgoing track set.
///
/// Owned by the session dispatch task; substitutions run to completion
/// within a single dispatched event, so no caller ever observes a
/// partially-switched peer set.
pub struct MediaController {
    capture: Arc<dyn MediaCapture>,
    local: Option<UserMedia>,
    screen: Option<LocalTrack>,
    muted: bool,
    camera_off: bool,
}

impl MediaController {
    /// Create a controller backed by the given capture collaborator.
    pub fn new(capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            capture,
            local: None,
            screen: None,
            muted: false,
            camera_off: false,
        }
    }

    /// Request microphone+camera capture. Idempotent while already
    /// acquired. On denial/failure the error is returned and the caller
    /// must not proceed to signaling.
    pub async fn acquire(&mut self) -> Result<()> {
        if self.local.is_some() {
            return Ok(());
        }
        let media = self.capture.user_media().await?;
        info!(
            "Local media acquired (audio: {}, video: {})",
            media.audio.is_some(),
            media.video.is_some()
        );
        self.local = Some(media);
        Ok(())
    }

    /// Whether local media has been acquired.
    pub fn is_acquired(&self) -> bool {
        self.local.is_some()
    }

    /// Attach the current outgoing track set to a connection. Applied when
    /// a peer session is created; if a screen share is already active, the
    /// screen track is substituted for the camera immediately so late
    /// joiners see the currently-shared source.
    pub async fn attach_to(&self, conn: &PeerConnection) -> Result<()> {
        if let Some(local) = &self.local {
            if let Some(audio) = &local.audio {
                conn.add_track(audio.as_track_local()).await?;
            }
            if let Some(video) = &local.video {
                conn.add_track(video.as_track_local()).await?;
            }
        }
        if let Some(screen) = &self.screen {
            if let Err(e) = conn
                .replace_video_track(Some(screen.as_track_local()))
                .await
            {
                warn!(
                    "Failed to apply active screen track to peer {}: {}",
                    conn.peer_id(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Toggle the microphone. Local-only: flips the enabled flag on the
    /// attached audio track.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(audio) = self.local.as_ref().and_then(|l| l.audio.as_ref()) {
            audio.set_enabled(!muted);
        }
        debug!("Microphone muted: {}", muted);
    }

    /// Toggle the camera. Local-only: flips the enabled flag on the
    /// attached camera track. An active screen share is unaffected.
    pub fn set_camera_off(&mut self, off: bool) {
        self.camera_off = off;
        if let Some(video) = self.local.as_ref().and_then(|l| l.video.as_ref()) {
            video.set_enabled(!off);
        }
        debug!("Camera off: {}", off);
    }

    /// Whether the microphone is muted.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Whether the camera is off.
    pub fn is_camera_off(&self) -> bool {
        self.camera_off
    }

    /// Whether a screen share is currently active.
    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Start a screen share: acquire a screen-capture track and substitute
    /// it for the outgoing video on every given connection, in place, with
    /// no renegotiation. Idempotent while already sharing.
    ///
    /// Returns a receiver that fires when the capture side ends the share
    /// on its own (OS/browser "stop sharing" chrome); the orchestrator
    /// treats that as an implicit stop.
    pub async fn start_screen_share(
        &mut self,
        conns: &[Arc<PeerConnection>],
    ) -> Result<watch::Receiver<bool>> {
        if let Some(screen) = &self.screen {
            return Ok(screen.ended());
        }

        let screen = self.capture.display_media().await?;
        info!("Screen share starting, substituting video for {} peer(s)", conns.len());

        for conn in conns {
            // Per-peer substitution failures are isolated; a sender that is
            // gone belongs to a connection that is already being torn down.
            if let Err(e) = conn
                .replace_video_track(Some(screen.as_track_local()))
                .await
            {
                warn!("Screen substitution failed for peer {}: {}", conn.peer_id(), e);
            }
        }

        let ended = screen.ended();
        self.screen = Some(screen);
        Ok(ended)
    }

    /// Stop an active screen share: substitute the camera track (or no
    /// video when none exists) back on every given connection and release
    /// the screen-capture track. No-op when not sharing.
    pub async fn stop_screen_share(&mut self, conns: &[Arc<PeerConnection>]) {
        let Some(screen) = self.screen.take() else {
            return;
        };
        screen.stop();

        let camera = self
            .local
            .as_ref()
            .and_then(|l| l.video.as_ref())
            .map(|v| v.as_track_local());

        info!(
            "Screen share stopped, restoring {} for {} peer(s)",
            if camera.is_some() { "camera" } else { "no video" },
            conns.len()
        );

        for conn in conns {
            if let Err(e) = conn.replace_video_track(camera.clone()).await {
                warn!("Camera restore failed for peer {}: {}", conn.peer_id(), e);
            }
        }
    }

    /// Stop and drop every local track and reset the toggle flags. Used on
    /// leave.
    pub fn release(&mut self) {
        if let Some(local) = self.local.take() {
            if let Some(audio) = &local.audio {
                audio.stop();
            }
            if let Some(video) = &local.video {
                video.stop();
            }
        }
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        self.muted = false;
        self.camera_off = false;
        debug!("Local media released");
    }
}
