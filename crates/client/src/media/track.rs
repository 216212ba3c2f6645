//! Local outgoing media tracks
//!
//! A [`LocalTrack`] wraps the sample-based local track handed to peer
//! connections, plus the two pieces of state the transport itself does not
//! model: an `enabled` flag (mute / camera-off semantics: toggling it is a
//! local-only operation, no renegotiation, no signaling traffic) and an
//! `ended` signal (the capture side reporting that the source went away,
//! e.g. the user stopped a screen share from the OS picker).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Kind of a local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Kind name for logging and track ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// A local outgoing media track.
///
/// The underlying sample track is shared by reference with every peer
/// connection it is attached to; substitution swaps which track a sender
/// carries, never the samples themselves.
pub struct LocalTrack {
    kind: TrackKind,
    sample_track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    ended_tx: watch::Sender<bool>,
    /// Capture pump tasks feeding this track; aborted on stop.
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTrack {
    /// Create an audio (Opus) track.
    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        };
        Self::new(TrackKind::Audio, codec, id.into(), stream_id.into())
    }

    /// Create a video (VP8) track.
    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        };
        Self::new(TrackKind::Video, codec, id.into(), stream_id.into())
    }

    fn new(kind: TrackKind, codec: RTCRtpCodecCapability, id: String, stream_id: String) -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            kind,
            sample_track: Arc::new(TrackLocalStaticSample::new(codec, id, stream_id)),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            ended_tx,
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Track kind.
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Track id (unique within the local stream).
    pub fn id(&self) -> String {
        self.sample_track.id().to_string()
    }

    /// The sample track as the trait object peer connections consume.
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.sample_track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Enable or disable the track. Disabled tracks drop writes; nothing is
    /// renegotiated and no signaling traffic is produced.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the track has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track: abort capture pumps and drop further writes.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
    }

    /// Signal that the capture source ended on its own (e.g. the user
    /// stopped sharing from the OS/browser UI).
    pub fn mark_ended(&self) {
        let _ = self.ended_tx.send(true);
    }

    /// Subscribe to the end-of-source signal.
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    /// Write one sample. Writes on a disabled or stopped track are dropped
    /// silently; this is what carries mute/camera-off semantics.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) {
        if self.is_stopped() || !self.is_enabled() {
            return;
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        // A track with no bound senders accepts and discards samples; real
        // transport errors here are not actionable for the capture side.
        let _ = self.sample_track.write_sample(&sample).await;
    }

    /// Spawn a pump task writing `frame` every `interval` until the track
    /// is stopped. The pump holds only the shared track internals, so
    /// dropping the `LocalTrack` also tears it down.
    pub fn pump_frames(&self, frame: Bytes, interval: Duration) {
        let sample_track = Arc::clone(&self.sample_track);
        let enabled = Arc::clone(&self.enabled);
        let stopped = Arc::clone(&self.stopped);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                if !enabled.load(Ordering::SeqCst) {
                    continue;
                }
                let sample = Sample {
                    data: frame.clone(),
                    duration: interval,
                    ..Default::default()
                };
                let _ = sample_track.write_sample(&sample).await;
            }
        });
        self.pumps.lock().push(handle);
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.sample_track.id())
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enabled_toggle() {
        let track = LocalTrack::audio("mic", "local");
        assert!(track.is_enabled());
        track.set_enabled(false);
        assert!(!track.is_enabled());
        track.set_enabled(true);
        assert!(track.is_enabled());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let track = LocalTrack::video("cam", "local");
        track.stop();
        track.stop();
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn test_writes_after_stop_are_dropped() {
        let track = LocalTrack::video("cam", "local");
        track.stop();
        track
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(33))
            .await;
    }

    #[tokio::test]
    async fn test_ended_signal() {
        let track = LocalTrack::video("screen", "local");
        let mut rx = track.ended();
        assert!(!*rx.borrow());
        track.mark_ended();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
