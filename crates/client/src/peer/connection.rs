//! Transport negotiation adapter
//!
//! Thin façade over `RTCPeerConnection`. Each instance belongs to exactly
//! one peer session and forwards its transport callbacks — local
//! candidates, remote tracks, incoming data channels, connection state —
//! into the session dispatch queue tagged with `(peer_id, epoch)`, so the
//! orchestrator can recognize events from an already-replaced connection
//! as stale and drop them.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::session::DriverEvent;
use crate::{Error, Result, SessionConfig};

use roomlink_proto::PeerId;

/// One peer connection, bound to a peer session by `(peer_id, epoch)`.
pub struct PeerConnection {
    peer_id: PeerId,
    epoch: u64,
    pc: Arc<RTCPeerConnection>,
}

impl PeerConnection {
    /// Build a connection for `peer_id` and wire its callbacks into the
    /// dispatch queue.
    pub(crate) async fn new(
        peer_id: PeerId,
        epoch: u64,
        config: &SessionConfig,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(config.rtc_configuration())
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {}", e)))?,
        );

        debug!("Created peer connection for {} (epoch {})", peer_id, epoch);

        // Local candidates trickle out as candidate envelopes.
        {
            let events = events.clone();
            let peer_id = peer_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = &candidate {
                    match candidate.to_json().map(|init| serde_json::to_value(&init)) {
                        Ok(Ok(value)) => {
                            let _ = events.send(DriverEvent::LocalCandidate {
                                peer_id: peer_id.clone(),
                                epoch,
                                candidate: value,
                            });
                        }
                        Ok(Err(e)) => warn!("Failed to encode local candidate: {}", e),
                        Err(e) => warn!("Failed to convert local candidate: {}", e),
                    }
                } else {
                    trace!("Candidate gathering complete for peer {}", peer_id);
                }
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            let peer_id = peer_id.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let _ = events.send(DriverEvent::RemoteTrack {
                    peer_id: peer_id.clone(),
                    epoch,
                    track,
                });
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            let peer_id = peer_id.clone();
            pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let _ = events.send(DriverEvent::RemoteDataChannel {
                    peer_id: peer_id.clone(),
                    epoch,
                    channel,
                });
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            let peer_id = peer_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let _ = events.send(DriverEvent::ConnectionState {
                    peer_id: peer_id.clone(),
                    epoch,
                    state,
                });
                Box::pin(async {})
            }));
        }

        Ok(Self { peer_id, epoch, pc })
    }

    /// The peer this connection belongs to.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Creation epoch; events tagged with an older epoch are stale.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current connection state.
    pub fn state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    /// Whether the connection reached a terminal condition. A terminated
    /// connection is never reused; a fresh one must be created.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.state(),
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
        )
    }

    /// Synthesize an offer: create it, install it as the local
    /// description, and return it as the opaque wire blob.
    pub async fn create_offer(&self) -> Result<Value> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set local description: {}", e)))?;
        self.local_description_value().await
    }

    /// Synthesize an answer to a previously-applied remote offer.
    pub async fn create_answer(&self) -> Result<Value> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set local description: {}", e)))?;
        self.local_description_value().await
    }

    async fn local_description_value(&self) -> Result<Value> {
        let desc = self.pc.local_description().await.ok_or_else(|| {
            Error::WebRtcError("Local description missing after negotiation".into())
        })?;
        Ok(serde_json::to_value(&desc)?)
    }

    /// Apply a remote session description received through the relay.
    pub async fn apply_remote_description(&self, sdp: &Value) -> Result<()> {
        let desc: RTCSessionDescription = serde_json::from_value(sdp.clone())
            .map_err(|e| Error::InvalidEnvelope(format!("Bad session description: {}", e)))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    /// Append a remote connectivity candidate. Callers are expected to
    /// discard the error: malformed or late candidates are a normal part
    /// of trickle negotiation and must never surface.
    pub async fn add_remote_candidate(&self, candidate: &Value) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.clone())
            .map_err(|e| Error::InvalidEnvelope(format!("Bad candidate: {}", e)))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to add candidate: {}", e)))
    }

    /// Attach a local outgoing track.
    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>> {
        self.pc
            .add_track(track)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to add track: {}", e)))
    }

    /// The sender currently carrying outgoing video, if any.
    pub async fn video_sender(&self) -> Option<Arc<RTCRtpSender>> {
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                if track.kind() == RTPCodecType::Video {
                    return Some(sender);
                }
            }
        }
        None
    }

    /// Substitute the outgoing video track in place, without
    /// renegotiation. No-op when the connection carries no video sender.
    pub async fn replace_video_track(
        &self,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<()> {
        match self.video_sender().await {
            Some(sender) => sender
                .replace_track(track)
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to replace track: {}", e))),
            None => Ok(()),
        }
    }

    /// Id of the track currently feeding the video sender, if any.
    pub async fn video_track_id(&self) -> Option<String> {
        let sender = self.video_sender().await?;
        sender.track().await.map(|t| t.id().to_string())
    }

    /// Open a data channel on this connection.
    pub async fn create_data_channel(&self, label: &str) -> Result<Arc<RTCDataChannel>> {
        self.pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to create data channel: {}", e)))
    }

    /// Close the connection. Idempotent; close errors are swallowed.
    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Error closing peer connection {}: {}", self.peer_id, e);
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("epoch", &self.epoch)
            .field("state", &self.state())
            .finish()
    }
}
