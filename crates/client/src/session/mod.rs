//! Session orchestration
//!
//! The session is one process-wide state machine: it reacts to relay
//! envelopes and local user intents, drives the transport adapter, updates
//! the peer registry and reconciles membership. All of that happens on a
//! single dispatch task ([`driver::SessionDriver`]); this module holds the
//! state model and the public [`RoomClient`]/[`RoomHandle`]/[`RoomEvent`]
//! surface.

pub(crate) mod driver;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

use crate::media::MediaCapture;
use crate::{Error, Result, SessionConfig};

use roomlink_proto::{new_peer_id, Envelope, PeerId};

/// Session state.
///
/// Always derived from the underlying channel/registry state via
/// [`derive_state`], never stored independently — this keeps the displayed
/// state from drifting away from actual connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No room, no signaling channel.
    Idle,
    /// Signaling channel open, zero peers.
    Joined,
    /// Signaling channel open, at least one peer.
    Calling,
    /// Display-only label for presentation layers; derivation never
    /// produces it.
    Ended,
}

impl SessionState {
    /// State name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Joined => "joined",
            SessionState::Calling => "calling",
            SessionState::Ended => "ended",
        }
    }
}

/// Derive the session state from the channel/registry facts.
pub fn derive_state(channel_open: bool, peer_count: usize) -> SessionState {
    if peer_count > 0 {
        SessionState::Calling
    } else if channel_open {
        SessionState::Joined
    } else {
        SessionState::Idle
    }
}

/// Events surfaced to the embedding application.
///
/// Failures cross this boundary as short human-readable [`RoomEvent::Notice`]
/// strings, never as structured error codes.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The derived session state changed.
    StateChanged(SessionState),

    /// The relay pushed a new roster snapshot.
    MembersChanged(Vec<PeerId>),

    /// A peer session was torn down (hang-up, failure, roster removal).
    PeerRemoved { peer_id: PeerId },

    /// A remote media track arrived for a peer.
    RemoteTrack {
        peer_id: PeerId,
        track: Arc<TrackRemote>,
    },

    /// The chat channel to a peer opened.
    ChatOpened { peer_id: PeerId },

    /// The chat channel to a peer closed.
    ChatClosed { peer_id: PeerId },

    /// A chat message arrived from a peer.
    ChatMessage { peer_id: PeerId, text: String },

    /// Screen sharing started or stopped.
    ScreenShareChanged { active: bool },

    /// Human-readable status/error line for the user.
    Notice { message: String },
}

impl RoomEvent {
    /// Event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged(_) => "state_changed",
            Self::MembersChanged(_) => "members_changed",
            Self::PeerRemoved { .. } => "peer_removed",
            Self::RemoteTrack { .. } => "remote_track",
            Self::ChatOpened { .. } => "chat_opened",
            Self::ChatClosed { .. } => "chat_closed",
            Self::ChatMessage { .. } => "chat_message",
            Self::ScreenShareChanged { .. } => "screen_share_changed",
            Self::Notice { .. } => "notice",
        }
    }
}

/// Point-in-time view of the session, for status displays.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub room: Option<String>,
    pub members: Vec<PeerId>,
    pub peers: Vec<PeerId>,
    pub muted: bool,
    pub camera_off: bool,
    pub screen_sharing: bool,
}

/// User intents, dispatched into the session loop with a reply channel.
pub(crate) enum Command {
    Join {
        room: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Call {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    HangUp {
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<Result<()>>,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<Result<usize>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetCameraOff {
        off: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Everything the dispatch loop reacts to: inbound envelopes, transport
/// callbacks, channel lifecycle, capture signals and user commands. One
/// queue, processed in arrival order, run-to-completion per event.
pub(crate) enum DriverEvent {
    /// User intent.
    Command(Command),
    /// Inbound signaling envelope.
    Signal(Envelope),
    /// The signaling channel closed (`manual` = user-initiated leave).
    SignalingClosed { manual: bool },
    /// The transport produced a local connectivity candidate.
    LocalCandidate {
        peer_id: PeerId,
        epoch: u64,
        candidate: Value,
    },
    /// A remote media track arrived.
    RemoteTrack {
        peer_id: PeerId,
        epoch: u64,
        track: Arc<TrackRemote>,
    },
    /// The remote side opened a data channel.
    RemoteDataChannel {
        peer_id: PeerId,
        epoch: u64,
        channel: Arc<RTCDataChannel>,
    },
    /// Transport connection state changed.
    ConnectionState {
        peer_id: PeerId,
        epoch: u64,
        state: RTCPeerConnectionState,
    },
    /// Chat channel opened.
    ChatOpened { peer_id: PeerId },
    /// Chat channel closed.
    ChatClosed { peer_id: PeerId },
    /// Chat message received.
    ChatMessage { peer_id: PeerId, text: String },
    /// The screen-capture source ended on its own (OS/browser stop).
    ScreenShareEnded,
}

/// Entry point: spawns the session dispatch task.
pub struct RoomClient;

impl RoomClient {
    /// Spawn a session. Returns the command handle and the stream of
    /// [`RoomEvent`]s for the embedding application.
    ///
    /// The session lives for the process lifetime: it is reset to idle on
    /// leave or relay loss, never torn down.
    pub fn spawn(
        config: SessionConfig,
        capture: Arc<dyn MediaCapture>,
    ) -> (RoomHandle, mpsc::UnboundedReceiver<RoomEvent>) {
        let self_id = new_peer_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let driver = driver::SessionDriver::new(
            config,
            capture,
            self_id.clone(),
            events_tx.clone(),
            events_rx,
            out_tx,
        );
        tokio::spawn(driver.run());

        (
            RoomHandle {
                events: events_tx,
                self_id,
            },
            out_rx,
        )
    }
}

/// Cloneable handle for driving a session.
#[derive(Clone)]
pub struct RoomHandle {
    events: mpsc::UnboundedSender<DriverEvent>,
    self_id: PeerId,
}

impl RoomHandle {
    /// This process's peer identity.
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Join a room: acquire local media, open the signaling channel, send
    /// the `join` envelope. A no-op while a channel is already open.
    /// Capture denial fails the join and nothing is signaled.
    pub async fn join(&self, room: impl Into<String>) -> Result<()> {
        self.command(|reply| Command::Join {
            room: room.into(),
            reply,
        })
        .await
    }

    /// Call a peer: create its session, open the chat channel and send an
    /// offer.
    pub async fn call(&self, peer_id: impl Into<PeerId>) -> Result<()> {
        self.command(|reply| Command::Call {
            peer_id: peer_id.into(),
            reply,
        })
        .await
    }

    /// Hang up every active peer session; stays in the room.
    pub async fn hang_up(&self) -> Result<()> {
        self.command(|reply| Command::HangUp { reply }).await
    }

    /// Leave the room: send `leave`, tear down every peer session, close
    /// the signaling channel, release local media.
    pub async fn leave(&self) -> Result<()> {
        self.command(|reply| Command::Leave { reply }).await
    }

    /// Broadcast a chat line to every open chat channel. Returns the
    /// number of channels the message was handed to; per-channel send
    /// failures are best-effort and dropped.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<usize> {
        self.command(|reply| Command::SendChat {
            text: text.into(),
            reply,
        })
        .await
    }

    /// Toggle the microphone (local-only, no renegotiation).
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.command(|reply| Command::SetMuted { muted, reply }).await
    }

    /// Toggle the camera (local-only, no renegotiation).
    pub async fn set_camera_off(&self, off: bool) -> Result<()> {
        self.command(|reply| Command::SetCameraOff { off, reply })
            .await
    }

    /// Switch the outgoing video to a screen capture across every active
    /// peer, in place.
    pub async fn start_screen_share(&self) -> Result<()> {
        self.command(|reply| Command::StartScreenShare { reply })
            .await
    }

    /// Switch the outgoing video back to the camera (or no video) across
    /// every active peer.
    pub async fn stop_screen_share(&self) -> Result<()> {
        self.command(|reply| Command::StopScreenShare { reply })
            .await
    }

    /// Current session snapshot.
    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(DriverEvent::Command(Command::Snapshot { reply }))
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(DriverEvent::Command(build(reply)))
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }
}
