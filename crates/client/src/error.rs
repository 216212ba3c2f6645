//! Error types for roomlink-client

use thiserror::Error;

/// Result type alias for roomlink-client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for roomlink-client
#[derive(Debug, Error)]
pub enum Error {
    /// Capture device acquisition failed or was denied; fatal to the
    /// join/call attempt and surfaced to the user.
    #[error("Media capture failed: {0}")]
    CaptureFailed(String),

    /// Signaling transport problem (connect failure, channel loss).
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer connection / negotiation error.
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Data channel error. Sends are best-effort; callers are permitted
    /// to discard this.
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Envelope that could not be interpreted.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Operation requires an open signaling channel.
    #[error("Not connected to a room")]
    NotConnected,

    /// The session dispatch loop is gone.
    #[error("Session closed")]
    SessionClosed,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
