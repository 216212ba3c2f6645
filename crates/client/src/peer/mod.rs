//! Peer registry
//!
//! The authoritative map from peer identity to that peer's connection
//! state, negotiation channel and media handles — "who am I currently
//! connected to". Owned exclusively by the session dispatch task, so it is
//! a plain map: every mutation happens inside one dispatched event.

pub mod connection;

pub use connection::PeerConnection;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::track::track_remote::TrackRemote;

use crate::media::MediaController;
use crate::session::DriverEvent;
use crate::{Result, SessionConfig};

use roomlink_proto::PeerId;

/// State tracked for one remote peer.
pub struct PeerSession {
    /// Remote peer identity.
    pub(crate) peer_id: PeerId,
    /// Creation epoch; transport events carrying an older epoch are stale.
    pub(crate) epoch: u64,
    /// The negotiation/transport handle.
    pub(crate) connection: Arc<PeerConnection>,
    /// Chat channel, present once either side opened one.
    pub(crate) data_channel: Option<Arc<RTCDataChannel>>,
    /// Remote media handles, populated as remote tracks arrive.
    pub(crate) remote_tracks: Vec<Arc<TrackRemote>>,
}

impl PeerSession {
    fn new(peer_id: PeerId, epoch: u64, connection: Arc<PeerConnection>) -> Self {
        Self {
            peer_id,
            epoch,
            connection,
            data_channel: None,
            remote_tracks: Vec::new(),
        }
    }

    /// The connection handle.
    pub fn connection(&self) -> &Arc<PeerConnection> {
        &self.connection
    }

    /// Whether the chat channel is open.
    pub fn chat_open(&self) -> bool {
        self.data_channel
            .as_ref()
            .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false)
    }

    /// Close channel and connection handles. Idempotent; close errors are
    /// swallowed.
    async fn close(self) {
        if let Some(dc) = &self.data_channel {
            if let Err(e) = dc.close().await {
                debug!("Error closing data channel for {}: {}", self.peer_id, e);
            }
        }
        self.connection.close().await;
    }
}

/// The peer registry: at most one [`PeerSession`] per identity.
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerSession>,
    next_epoch: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            next_epoch: 1,
        }
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are tracked.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Tracked peer ids.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// Look up a peer session.
    pub fn get(&self, peer_id: &str) -> Option<&PeerSession> {
        self.peers.get(peer_id)
    }

    /// Look up a peer session mutably.
    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerSession> {
        self.peers.get_mut(peer_id)
    }

    /// Whether `(peer_id, epoch)` still names the live session. Transport
    /// events are revalidated against this after every suspension; a
    /// mismatch means the event belongs to a torn-down connection and is
    /// treated as a no-op.
    pub fn matches_epoch(&self, peer_id: &str, epoch: u64) -> bool {
        self.peers
            .get(peer_id)
            .map(|p| p.epoch == epoch)
            .unwrap_or(false)
    }

    /// Chat channels that are currently open, for broadcast sends.
    pub fn open_chat_channels(&self) -> Vec<Arc<RTCDataChannel>> {
        self.peers
            .values()
            .filter(|p| p.chat_open())
            .filter_map(|p| p.data_channel.clone())
            .collect()
    }

    /// Connection handles of every tracked peer.
    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .values()
            .map(|p| Arc::clone(&p.connection))
            .collect()
    }

    /// Make sure a live session exists for `peer_id`.
    ///
    /// Returns without touching anything when a session with a
    /// non-terminated connection already exists (idempotent creation).
    /// Otherwise builds a fresh connection — a terminated one is never
    /// reused — wires its callbacks into the dispatch queue, and attaches
    /// the current local outgoing tracks, including an already-active
    /// screen substitution so late joiners see the shared source.
    pub(crate) async fn ensure(
        &mut self,
        peer_id: &PeerId,
        config: &SessionConfig,
        media: &MediaController,
        events: &mpsc::UnboundedSender<DriverEvent>,
    ) -> Result<()> {
        if let Some(existing) = self.peers.get(peer_id) {
            if !existing.connection.is_terminated() {
                return Ok(());
            }
            debug!("Connection for {} is terminated, replacing it", peer_id);
        }

        if let Some(stale) = self.peers.remove(peer_id) {
            stale.close().await;
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let connection = Arc::new(
            PeerConnection::new(peer_id.clone(), epoch, config, events.clone()).await?,
        );
        media.attach_to(&connection).await?;

        info!("Peer session created for {} (epoch {})", peer_id, epoch);
        self.peers.insert(
            peer_id.clone(),
            PeerSession::new(peer_id.clone(), epoch, connection),
        );
        Ok(())
    }

    /// Remove one peer: close its handles, drop its remote media, delete
    /// the entry. Returns whether an entry existed.
    pub async fn remove(&mut self, peer_id: &str) -> bool {
        match self.peers.remove(peer_id) {
            Some(session) => {
                info!("Peer session removed for {}", peer_id);
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Remove every tracked peer. Used on leave and on relay disconnect.
    pub async fn remove_all(&mut self) -> Vec<PeerId> {
        let ids = self.peer_ids();
        for id in &ids {
            self.remove(id).await;
        }
        ids
    }

    /// Reconcile against a roster snapshot: tear down every tracked peer
    /// absent from `members` (minus self). A peer that silently vanished
    /// from the relay's roster is removed even without an explicit
    /// hang-up signal. Returns the removed ids.
    pub async fn reconcile(&mut self, members: &[PeerId], self_id: &PeerId) -> Vec<PeerId> {
        let gone: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|id| *id != self_id && !members.contains(id))
            .cloned()
            .collect();
        for id in &gone {
            self.remove(id).await;
        }
        gone
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire a chat data channel's callbacks into the dispatch queue. Used for
/// both locally-created channels and channels announced by the remote
/// side.
pub(crate) fn wire_data_channel(
    peer_id: &PeerId,
    dc: &Arc<RTCDataChannel>,
    events: &mpsc::UnboundedSender<DriverEvent>,
) {
    {
        let events = events.clone();
        let peer_id = peer_id.clone();
        dc.on_open(Box::new(move || {
            let _ = events.send(DriverEvent::ChatOpened {
                peer_id: peer_id.clone(),
            });
            Box::pin(async {})
        }));
    }
    {
        let events = events.clone();
        let peer_id = peer_id.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let text = String::from_utf8_lossy(&msg.data).to_string();
            let _ = events.send(DriverEvent::ChatMessage {
                peer_id: peer_id.clone(),
                text,
            });
            Box::pin(async {})
        }));
    }
    {
        let events = events.clone();
        let peer_id = peer_id.clone();
        dc.on_close(Box::new(move || {
            let _ = events.send(DriverEvent::ChatClosed {
                peer_id: peer_id.clone(),
            });
            Box::pin(async {})
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticCapture;

    struct Fixture {
        registry: PeerRegistry,
        config: SessionConfig,
        media: MediaController,
        events: mpsc::UnboundedSender<DriverEvent>,
        _events_rx: mpsc::UnboundedReceiver<DriverEvent>,
    }

    fn fixture() -> Fixture {
        let (events, _events_rx) = mpsc::unbounded_channel();
        Fixture {
            registry: PeerRegistry::new(),
            config: SessionConfig::default(),
            media: MediaController::new(Arc::new(SyntheticCapture::new())),
            events,
            _events_rx,
        }
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let mut fx = fixture();
        let peer: PeerId = "b".to_string();

        fx.registry
            .ensure(&peer, &fx.config, &fx.media, &fx.events)
            .await
            .unwrap();
        let first_epoch = fx.registry.get("b").unwrap().epoch;

        fx.registry
            .ensure(&peer, &fx.config, &fx.media, &fx.events)
            .await
            .unwrap();
        let second_epoch = fx.registry.get("b").unwrap().epoch;

        assert_eq!(first_epoch, second_epoch);
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_terminated_connection_is_replaced() {
        let mut fx = fixture();
        let peer: PeerId = "b".to_string();

        fx.registry
            .ensure(&peer, &fx.config, &fx.media, &fx.events)
            .await
            .unwrap();
        let first_epoch = fx.registry.get("b").unwrap().epoch;
        fx.registry.get("b").unwrap().connection.close().await;

        fx.registry
            .ensure(&peer, &fx.config, &fx.media, &fx.events)
            .await
            .unwrap();
        let second_epoch = fx.registry.get("b").unwrap().epoch;

        assert_ne!(first_epoch, second_epoch);
        assert_eq!(fx.registry.len(), 1);
        assert!(!fx.registry.matches_epoch("b", first_epoch));
        assert!(fx.registry.matches_epoch("b", second_epoch));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let mut fx = fixture();
        let peer: PeerId = "b".to_string();

        fx.registry
            .ensure(&peer, &fx.config, &fx.media, &fx.events)
            .await
            .unwrap();
        assert!(fx.registry.remove("b").await);
        assert!(!fx.registry.remove("b").await);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_registry_subset_of_roster() {
        let mut fx = fixture();
        let self_id: PeerId = "a".to_string();
        for id in ["b", "c", "d"] {
            fx.registry
                .ensure(&id.to_string(), &fx.config, &fx.media, &fx.events)
                .await
                .unwrap();
        }

        let members: Vec<PeerId> = vec!["a".into(), "c".into()];
        let removed = fx.registry.reconcile(&members, &self_id).await;

        let mut removed = removed;
        removed.sort();
        assert_eq!(removed, vec!["b".to_string(), "d".to_string()]);

        // Registry keys are a subset of the roster minus self.
        for id in fx.registry.peer_ids() {
            assert!(members.contains(&id) && id != self_id);
        }
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_all_empties_registry() {
        let mut fx = fixture();
        for id in ["b", "c"] {
            fx.registry
                .ensure(&id.to_string(), &fx.config, &fx.media, &fx.events)
                .await
                .unwrap();
        }
        let mut removed = fx.registry.remove_all().await;
        removed.sort();
        assert_eq!(removed, vec!["b".to_string(), "c".to_string()]);
        assert!(fx.registry.is_empty());
    }
}
