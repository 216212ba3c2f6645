//! Room-based WebRTC mesh client
//!
//! roomlink-client lets a process join a named room on a signaling relay,
//! discover the other occupants, and hold direct peer-to-peer audio/video/
//! data sessions with each of them (full mesh, no media relay). The core is
//! the session orchestrator: a single dispatch task that owns the peer
//! registry, reacts to relay envelopes, transport callbacks and user
//! intents, and keeps the displayed session state derived from the actual
//! channel/registry state at all times.
//!
//! ## Architecture
//!
//! - [`signaling`] — one WebSocket channel to the relay: typed envelopes,
//!   keepalive, manual-close discrimination.
//! - [`peer`] — the peer registry (who am I connected to) and the thin
//!   negotiation adapter over `RTCPeerConnection`.
//! - [`session`] — the orchestrator state machine and the public
//!   [`RoomClient`]/[`RoomHandle`]/[`RoomEvent`] API.
//! - [`media`] — the local outgoing track set: capture collaborator trait,
//!   mute/camera toggles, and in-place screen-share substitution across all
//!   live peer connections without renegotiation.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use roomlink_client::{RoomClient, SessionConfig, SyntheticCapture};
//!
//! # async fn run() -> roomlink_client::Result<()> {
//! let config = SessionConfig::new("ws://127.0.0.1:8080/ws");
//! let (handle, mut events) = RoomClient::spawn(config, Arc::new(SyntheticCapture::new()));
//!
//! handle.join("demo-room").await?;
//! while let Some(event) = events.recv().await {
//!     println!("room event: {}", event.name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{IceServerConfig, SessionConfig};
pub use error::{Error, Result};
pub use media::{LocalTrack, MediaCapture, SyntheticCapture, TrackKind, UserMedia};
pub use session::{RoomClient, RoomEvent, RoomHandle, SessionSnapshot, SessionState};

pub use roomlink_proto::{new_peer_id, Envelope, PeerId};
