//! Session dispatch loop
//!
//! One task owns all mutable session state — the signaling channel, the
//! peer registry, the media controller, the roster — and processes every
//! stimulus (relay envelope, transport callback, user command) from a
//! single queue, run-to-completion and in arrival order. Transport
//! callbacks reach the queue tagged with the connection epoch they came
//! from; by the time they are dispatched the peer may already be gone or
//! replaced, and a mismatched tag makes the event a no-op rather than an
//! error.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{MediaCapture, MediaController};
use crate::peer::{wire_data_channel, PeerRegistry};
use crate::session::{derive_state, Command, DriverEvent, RoomEvent, SessionSnapshot, SessionState};
use crate::signaling::SignalingChannel;
use crate::{Error, Result, SessionConfig};

use roomlink_proto::{Envelope, PeerId};

pub(crate) struct SessionDriver {
    config: SessionConfig,
    self_id: PeerId,
    room: Option<String>,
    signaling: Option<SignalingChannel>,
    registry: PeerRegistry,
    media: MediaController,
    /// Latest roster snapshot from the relay.
    members: Vec<PeerId>,
    /// Last derived state, kept only to detect changes.
    state: SessionState,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    events_rx: mpsc::UnboundedReceiver<DriverEvent>,
    out: mpsc::UnboundedSender<RoomEvent>,
    /// Task watching the active screen track's end-of-source signal.
    screen_watch: Option<JoinHandle<()>>,
}

impl SessionDriver {
    pub(crate) fn new(
        config: SessionConfig,
        capture: Arc<dyn MediaCapture>,
        self_id: PeerId,
        events_tx: mpsc::UnboundedSender<DriverEvent>,
        events_rx: mpsc::UnboundedReceiver<DriverEvent>,
        out: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        Self {
            config,
            self_id,
            room: None,
            signaling: None,
            registry: PeerRegistry::new(),
            media: MediaController::new(capture),
            members: Vec::new(),
            state: SessionState::Idle,
            events_tx,
            events_rx,
            out,
            screen_watch: None,
        }
    }

    /// Run the dispatch loop until every handle is gone.
    pub(crate) async fn run(mut self) {
        debug!("Session loop started (self id {})", self.self_id);
        while let Some(event) = self.events_rx.recv().await {
            self.dispatch(event).await;
        }
        debug!("Session loop ended");
    }

    async fn dispatch(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Command(command) => self.handle_command(command).await,
            DriverEvent::Signal(envelope) => self.handle_envelope(envelope).await,
            DriverEvent::SignalingClosed { manual } => self.handle_signaling_closed(manual).await,
            DriverEvent::LocalCandidate {
                peer_id,
                epoch,
                candidate,
            } => self.handle_local_candidate(peer_id, epoch, candidate),
            DriverEvent::RemoteTrack {
                peer_id,
                epoch,
                track,
            } => self.handle_remote_track(peer_id, epoch, track),
            DriverEvent::RemoteDataChannel {
                peer_id,
                epoch,
                channel,
            } => self.handle_remote_data_channel(peer_id, epoch, channel),
            DriverEvent::ConnectionState {
                peer_id,
                epoch,
                state,
            } => self.handle_connection_state(peer_id, epoch, state).await,
            DriverEvent::ChatOpened { peer_id } => self.emit(RoomEvent::ChatOpened { peer_id }),
            DriverEvent::ChatClosed { peer_id } => self.emit(RoomEvent::ChatClosed { peer_id }),
            DriverEvent::ChatMessage { peer_id, text } => {
                self.emit(RoomEvent::ChatMessage { peer_id, text })
            }
            DriverEvent::ScreenShareEnded => self.handle_screen_share_ended().await,
        }
    }

    // ========================================================================
    // User commands
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { room, reply } => {
                let _ = reply.send(self.handle_join(room).await);
            }
            Command::Call { peer_id, reply } => {
                let _ = reply.send(self.handle_call(peer_id).await);
            }
            Command::HangUp { reply } => {
                let _ = reply.send(self.handle_hang_up().await);
            }
            Command::Leave { reply } => {
                let _ = reply.send(self.handle_leave().await);
            }
            Command::SendChat { text, reply } => {
                let _ = reply.send(self.handle_send_chat(text).await);
            }
            Command::SetMuted { muted, reply } => {
                self.media.set_muted(muted);
                let _ = reply.send(Ok(()));
            }
            Command::SetCameraOff { off, reply } => {
                self.media.set_camera_off(off);
                let _ = reply.send(Ok(()));
            }
            Command::StartScreenShare { reply } => {
                let _ = reply.send(self.handle_start_screen_share().await);
            }
            Command::StopScreenShare { reply } => {
                self.handle_stop_screen_share().await;
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn handle_join(&mut self, room: String) -> Result<()> {
        if self.signaling_open() {
            debug!("Join requested while already connected, ignoring");
            return Ok(());
        }

        // Media first: a denied capture aborts the join before anything is
        // signaled.
        if let Err(e) = self.media.acquire().await {
            match &e {
                Error::CaptureFailed(reason) => {
                    self.notice(format!("Could not access camera/microphone: {}", reason))
                }
                other => self.notice(format!("Could not access camera/microphone: {}", other)),
            }
            return Err(e);
        }

        match SignalingChannel::connect(&self.config, &room, &self.self_id, self.events_tx.clone())
            .await
        {
            Ok(channel) => {
                info!("Joined room {} as {}", room, self.self_id);
                self.signaling = Some(channel);
                self.room = Some(room);
                self.sync_state();
                Ok(())
            }
            Err(e) => {
                self.notice("Could not reach the signaling server".to_string());
                Err(e)
            }
        }
    }

    async fn handle_call(&mut self, peer_id: PeerId) -> Result<()> {
        if !self.signaling_open() {
            self.notice("Signaling server is not connected".to_string());
            return Err(Error::NotConnected);
        }

        self.media.acquire().await?;
        self.registry
            .ensure(&peer_id, &self.config, &self.media, &self.events_tx)
            .await?;

        // Open the chat channel if neither side has yet.
        let needs_channel = self
            .registry
            .get(&peer_id)
            .map(|p| p.data_channel.is_none())
            .unwrap_or(false);
        if needs_channel {
            if let Some(conn) = self.registry.get(&peer_id).map(|p| Arc::clone(p.connection())) {
                let channel = conn
                    .create_data_channel(&self.config.data_channel_label)
                    .await?;
                wire_data_channel(&peer_id, &channel, &self.events_tx);
                if let Some(session) = self.registry.get_mut(&peer_id) {
                    session.data_channel = Some(channel);
                }
            }
        }

        let Some(conn) = self.registry.get(&peer_id).map(|p| Arc::clone(p.connection())) else {
            return Ok(());
        };
        let sdp = conn.create_offer().await?;
        info!("Calling {}", peer_id);
        self.send_envelope(Envelope::Offer {
            room: self.room_name(),
            from: self.self_id.clone(),
            to: peer_id,
            sdp,
        });
        self.sync_state();
        Ok(())
    }

    async fn handle_hang_up(&mut self) -> Result<()> {
        info!("Hanging up {} peer(s)", self.registry.len());
        let removed = self.registry.remove_all().await;
        for peer_id in removed {
            self.emit(RoomEvent::PeerRemoved { peer_id });
        }
        self.sync_state();
        Ok(())
    }

    async fn handle_leave(&mut self) -> Result<()> {
        info!("Leaving room");
        let removed = self.registry.remove_all().await;
        for peer_id in removed {
            self.emit(RoomEvent::PeerRemoved { peer_id });
        }

        self.handle_stop_screen_share().await;
        self.media.release();

        if let Some(channel) = self.signaling.take() {
            channel.send(Envelope::Leave {
                room: self.room_name(),
                from: self.self_id.clone(),
            });
            channel.close();
        }
        self.room = None;
        if !self.members.is_empty() {
            self.members.clear();
            self.emit(RoomEvent::MembersChanged(Vec::new()));
        }
        self.sync_state();
        Ok(())
    }

    async fn handle_send_chat(&mut self, text: String) -> Result<usize> {
        let channels = self.registry.open_chat_channels();
        if channels.is_empty() {
            self.notice("Chat channel not open yet; call a peer first".to_string());
            return Err(Error::DataChannelError("no open chat channel".into()));
        }

        let mut delivered = 0;
        for channel in channels {
            // Best-effort by contract: a failed send is dropped, not
            // retried or queued.
            match channel.send_text(text.clone()).await {
                Ok(_) => delivered += 1,
                Err(e) => debug!("Chat send failed: {}", e),
            }
        }
        Ok(delivered)
    }

    async fn handle_start_screen_share(&mut self) -> Result<()> {
        let was_sharing = self.media.is_screen_sharing();
        match self.media.start_screen_share(&self.registry.connections()).await {
            Ok(mut ended) => {
                if !was_sharing {
                    let events = self.events_tx.clone();
                    self.screen_watch = Some(tokio::spawn(async move {
                        if ended.changed().await.is_ok() && *ended.borrow() {
                            let _ = events.send(DriverEvent::ScreenShareEnded);
                        }
                    }));
                    self.emit(RoomEvent::ScreenShareChanged { active: true });
                }
                Ok(())
            }
            Err(e) => {
                self.notice(format!("Screen share failed: {}", e));
                Err(e)
            }
        }
    }

    async fn handle_stop_screen_share(&mut self) {
        if let Some(watch) = self.screen_watch.take() {
            watch.abort();
        }
        if self.media.is_screen_sharing() {
            self.media
                .stop_screen_share(&self.registry.connections())
                .await;
            self.emit(RoomEvent::ScreenShareChanged { active: false });
        }
    }

    async fn handle_screen_share_ended(&mut self) {
        if self.media.is_screen_sharing() {
            info!("Screen capture ended by the source, stopping share");
            self.handle_stop_screen_share().await;
        }
    }

    // ========================================================================
    // Inbound envelopes
    // ========================================================================

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Offer { from, sdp, .. } => self.handle_offer(from, sdp).await,
            Envelope::Answer { from, sdp, .. } => self.handle_answer(from, sdp).await,
            Envelope::Candidate {
                from, candidate, ..
            } => self.handle_candidate(from, candidate).await,
            Envelope::RoomMembers { members, .. } => self.handle_room_members(members).await,
            other => trace!("Ignoring {} envelope from relay", other.name()),
        }
    }

    async fn handle_offer(&mut self, from: PeerId, sdp: Value) {
        if from.is_empty() {
            return;
        }
        debug!("Offer from {}", from);

        if let Err(e) = self.media.acquire().await {
            self.notice(format!("Could not access camera/microphone: {}", e));
            return;
        }
        if let Err(e) = self
            .registry
            .ensure(&from, &self.config, &self.media, &self.events_tx)
            .await
        {
            warn!("Could not create peer session for {}: {}", from, e);
            return;
        }
        let Some(conn) = self.registry.get(&from).map(|p| Arc::clone(p.connection())) else {
            return;
        };

        if let Err(e) = conn.apply_remote_description(&sdp).await {
            warn!("Ignoring unusable offer from {}: {}", from, e);
            return;
        }
        match conn.create_answer().await {
            Ok(answer) => {
                debug!("Answering {}", from);
                self.send_envelope(Envelope::Answer {
                    room: self.room_name(),
                    from: self.self_id.clone(),
                    to: from,
                    sdp: answer,
                });
            }
            Err(e) => warn!("Failed to answer offer from {}: {}", from, e),
        }
        self.sync_state();
    }

    async fn handle_answer(&mut self, from: PeerId, sdp: Value) {
        let Some(conn) = self.registry.get(&from).map(|p| Arc::clone(p.connection())) else {
            trace!("Answer from unknown peer {}, ignoring", from);
            return;
        };
        debug!("Answer from {}", from);
        if let Err(e) = conn.apply_remote_description(&sdp).await {
            // Stale or malformed descriptions are ignored, never fatal.
            warn!("Ignoring unusable answer from {}: {}", from, e);
        }
        self.sync_state();
    }

    async fn handle_candidate(&mut self, from: PeerId, candidate: Value) {
        let Some(session) = self.registry.get(&from) else {
            trace!("Candidate from unknown peer {}, ignoring", from);
            return;
        };
        if session.connection().is_terminated() {
            return;
        }
        let conn = Arc::clone(session.connection());
        // Deliberate swallow: malformed/late candidates are a normal part
        // of trickle negotiation and never surface.
        if let Err(e) = conn.add_remote_candidate(&candidate).await {
            debug!("Ignoring candidate from {}: {}", from, e);
        }
    }

    async fn handle_room_members(&mut self, members: Vec<PeerId>) {
        debug!("Roster snapshot: {} member(s)", members.len());
        self.members = members.clone();
        self.emit(RoomEvent::MembersChanged(members.clone()));

        // Self-healing reconciliation: peers missing from the roster are
        // torn down even without an explicit hang-up signal.
        let removed = self.registry.reconcile(&members, &self.self_id).await;
        for peer_id in removed {
            self.emit(RoomEvent::PeerRemoved { peer_id });
        }
        self.sync_state();
    }

    // ========================================================================
    // Channel / transport callbacks
    // ========================================================================

    async fn handle_signaling_closed(&mut self, manual: bool) {
        debug!("Signaling channel closed (manual: {})", manual);
        self.signaling = None;

        // No partial survival across a signaling outage: the whole mesh
        // comes down with the relay connection.
        let removed = self.registry.remove_all().await;
        for peer_id in removed {
            self.emit(RoomEvent::PeerRemoved { peer_id });
        }
        self.room = None;
        if !self.members.is_empty() {
            self.members.clear();
            self.emit(RoomEvent::MembersChanged(Vec::new()));
        }
        if !manual {
            self.notice("Signaling connection lost".to_string());
        }
        self.sync_state();
    }

    fn handle_local_candidate(&mut self, peer_id: PeerId, epoch: u64, candidate: Value) {
        if !self.registry.matches_epoch(&peer_id, epoch) {
            trace!("Dropping stale local candidate for {}", peer_id);
            return;
        }
        if self.signaling_open() && self.room.is_some() {
            self.send_envelope(Envelope::Candidate {
                room: self.room_name(),
                from: self.self_id.clone(),
                to: peer_id,
                candidate,
            });
        }
    }

    fn handle_remote_track(&mut self, peer_id: PeerId, epoch: u64, track: Arc<TrackRemote>) {
        if !self.registry.matches_epoch(&peer_id, epoch) {
            trace!("Dropping remote track for stale session {}", peer_id);
            return;
        }
        debug!("Remote {} track from {}", track.kind(), peer_id);
        if let Some(session) = self.registry.get_mut(&peer_id) {
            session.remote_tracks.push(Arc::clone(&track));
        }
        self.emit(RoomEvent::RemoteTrack { peer_id, track });
    }

    fn handle_remote_data_channel(
        &mut self,
        peer_id: PeerId,
        epoch: u64,
        channel: Arc<RTCDataChannel>,
    ) {
        if !self.registry.matches_epoch(&peer_id, epoch) {
            trace!("Dropping data channel for stale session {}", peer_id);
            return;
        }
        debug!("Data channel '{}' announced by {}", channel.label(), peer_id);
        wire_data_channel(&peer_id, &channel, &self.events_tx);
        if let Some(session) = self.registry.get_mut(&peer_id) {
            session.data_channel = Some(channel);
        }
    }

    async fn handle_connection_state(
        &mut self,
        peer_id: PeerId,
        epoch: u64,
        state: RTCPeerConnectionState,
    ) {
        trace!("Connection state for {}: {}", peer_id, state);
        if !self.registry.matches_epoch(&peer_id, epoch) {
            return;
        }
        if matches!(
            state,
            RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Closed
        ) {
            // One peer failing is isolated: only its session goes away.
            info!("Connection to {} is {}, removing peer", peer_id, state);
            if self.registry.remove(&peer_id).await {
                self.emit(RoomEvent::PeerRemoved { peer_id });
            }
            self.sync_state();
        }
    }

    // ========================================================================
    // Shared plumbing
    // ========================================================================

    fn signaling_open(&self) -> bool {
        self.signaling.as_ref().map(|s| s.is_open()).unwrap_or(false)
    }

    fn room_name(&self) -> String {
        self.room.clone().unwrap_or_default()
    }

    fn send_envelope(&self, envelope: Envelope) {
        if let Some(channel) = &self.signaling {
            channel.send(envelope);
        }
    }

    /// Recompute the derived state after a channel/registry mutation and
    /// surface a change. The state is never set directly anywhere.
    fn sync_state(&mut self) {
        let state = derive_state(self.signaling_open(), self.registry.len());
        if state != self.state {
            info!("Session state: {} -> {}", self.state.as_str(), state.as_str());
            self.state = state;
            self.emit(RoomEvent::StateChanged(state));
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            room: self.room.clone(),
            members: self.members.clone(),
            peers: self.registry.peer_ids(),
            muted: self.media.is_muted(),
            camera_off: self.media.is_camera_off(),
            screen_sharing: self.media.is_screen_sharing(),
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.out.send(event);
    }

    fn notice(&self, message: String) {
        self.emit(RoomEvent::Notice { message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticCapture;
    use crate::peer::PeerConnection;
    use serde_json::json;

    struct Harness {
        driver: SessionDriver,
        out_rx: mpsc::UnboundedReceiver<RoomEvent>,
    }

    fn harness() -> Harness {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let driver = SessionDriver::new(
            SessionConfig::default(),
            Arc::new(SyntheticCapture::new()),
            "self".to_string(),
            events_tx,
            events_rx,
            out_tx,
        );
        Harness { driver, out_rx }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RoomEvent>) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// A syntactically valid offer blob, produced by a real transport
    /// instance with a data channel so the offer carries a media section.
    async fn real_offer_sdp() -> Value {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::new("scratch".into(), 0, &SessionConfig::default(), tx)
            .await
            .unwrap();
        conn.create_data_channel("chat").await.unwrap();
        conn.create_offer().await.unwrap()
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_peer_is_a_noop() {
        let mut h = harness();
        h.driver
            .dispatch(DriverEvent::Signal(Envelope::Candidate {
                room: "r1".into(),
                from: "ghost".into(),
                to: "self".into(),
                candidate: json!({"candidate": "candidate:1 1 udp 1 127.0.0.1 5000 typ host"}),
            }))
            .await;
        assert!(h.driver.registry.is_empty());
        assert_eq!(h.driver.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_answer_from_unknown_peer_is_a_noop() {
        let mut h = harness();
        h.driver
            .dispatch(DriverEvent::Signal(Envelope::Answer {
                room: "r1".into(),
                from: "ghost".into(),
                to: "self".into(),
                sdp: json!({"type": "answer", "sdp": "v=0\r\n"}),
            }))
            .await;
        assert!(h.driver.registry.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_offer_creates_peer_session_and_state() {
        let mut h = harness();
        let sdp = real_offer_sdp().await;
        h.driver
            .dispatch(DriverEvent::Signal(Envelope::Offer {
                room: "r1".into(),
                from: "b".into(),
                to: "self".into(),
                sdp,
            }))
            .await;

        assert_eq!(h.driver.registry.len(), 1);
        assert!(h.driver.registry.get("b").is_some());
        assert_eq!(h.driver.state, SessionState::Calling);
    }

    #[tokio::test]
    async fn test_malformed_offer_still_tracks_peer_but_never_panics() {
        let mut h = harness();
        h.driver
            .dispatch(DriverEvent::Signal(Envelope::Offer {
                room: "r1".into(),
                from: "b".into(),
                to: "self".into(),
                sdp: json!("not an sdp"),
            }))
            .await;
        // The session was created before the description turned out to be
        // unusable; the bad blob itself is swallowed.
        assert_eq!(h.driver.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_roster_reconciliation_removes_vanished_peer() {
        let mut h = harness();
        let sdp = real_offer_sdp().await;
        h.driver
            .dispatch(DriverEvent::Signal(Envelope::Offer {
                room: "r1".into(),
                from: "b".into(),
                to: "self".into(),
                sdp,
            }))
            .await;
        assert_eq!(h.driver.state, SessionState::Calling);
        drain(&mut h.out_rx);

        h.driver
            .dispatch(DriverEvent::Signal(Envelope::RoomMembers {
                room: "r1".into(),
                members: vec!["self".into()],
            }))
            .await;

        assert!(h.driver.registry.is_empty());
        let events = drain(&mut h.out_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, RoomEvent::PeerRemoved { peer_id } if peer_id == "b")));
        // Without a signaling channel the derived state falls to idle.
        assert_eq!(h.driver.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_registry_stays_subset_of_roster() {
        let mut h = harness();
        for peer in ["b", "c"] {
            let sdp = real_offer_sdp().await;
            h.driver
                .dispatch(DriverEvent::Signal(Envelope::Offer {
                    room: "r1".into(),
                    from: peer.into(),
                    to: "self".into(),
                    sdp,
                }))
                .await;
        }
        assert_eq!(h.driver.registry.len(), 2);

        h.driver
            .dispatch(DriverEvent::Signal(Envelope::RoomMembers {
                room: "r1".into(),
                members: vec!["self".into(), "c".into()],
            }))
            .await;

        let ids = h.driver.registry.peer_ids();
        assert_eq!(ids, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_connection_failure_removes_only_that_peer() {
        let mut h = harness();
        for peer in ["b", "c"] {
            let sdp = real_offer_sdp().await;
            h.driver
                .dispatch(DriverEvent::Signal(Envelope::Offer {
                    room: "r1".into(),
                    from: peer.into(),
                    to: "self".into(),
                    sdp,
                }))
                .await;
        }
        let epoch = h.driver.registry.get("b").unwrap().connection().epoch();

        h.driver
            .dispatch(DriverEvent::ConnectionState {
                peer_id: "b".into(),
                epoch,
                state: RTCPeerConnectionState::Failed,
            })
            .await;

        assert!(h.driver.registry.get("b").is_none());
        assert!(h.driver.registry.get("c").is_some());
    }

    #[tokio::test]
    async fn test_stale_epoch_connection_event_is_dropped() {
        let mut h = harness();
        let sdp = real_offer_sdp().await;
        h.driver
            .dispatch(DriverEvent::Signal(Envelope::Offer {
                room: "r1".into(),
                from: "b".into(),
                to: "self".into(),
                sdp,
            }))
            .await;
        let live_epoch = h.driver.registry.get("b").unwrap().connection().epoch();

        h.driver
            .dispatch(DriverEvent::ConnectionState {
                peer_id: "b".into(),
                epoch: live_epoch + 17,
                state: RTCPeerConnectionState::Failed,
            })
            .await;

        // The mismatched event is a no-op; the live session survives.
        assert!(h.driver.registry.get("b").is_some());
    }

    #[tokio::test]
    async fn test_signaling_closed_tears_down_all_peers() {
        let mut h = harness();
        for peer in ["b", "c"] {
            let sdp = real_offer_sdp().await;
            h.driver
                .dispatch(DriverEvent::Signal(Envelope::Offer {
                    room: "r1".into(),
                    from: peer.into(),
                    to: "self".into(),
                    sdp,
                }))
                .await;
        }
        drain(&mut h.out_rx);

        h.driver
            .dispatch(DriverEvent::SignalingClosed { manual: false })
            .await;

        assert!(h.driver.registry.is_empty());
        assert_eq!(h.driver.state, SessionState::Idle);
        let events = drain(&mut h.out_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, RoomEvent::Notice { message } if message.contains("lost"))));
    }

    #[tokio::test]
    async fn test_manual_close_is_not_surfaced_as_error() {
        let mut h = harness();
        h.driver
            .dispatch(DriverEvent::SignalingClosed { manual: true })
            .await;
        let events = drain(&mut h.out_rx);
        assert!(!events.iter().any(|e| matches!(e, RoomEvent::Notice { .. })));
    }

    #[tokio::test]
    async fn test_capture_denial_aborts_join() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut driver = SessionDriver::new(
            SessionConfig::default(),
            Arc::new(SyntheticCapture::denying_user_media()),
            "self".to_string(),
            events_tx,
            events_rx,
            out_tx,
        );

        let result = driver.handle_join("r1".to_string()).await;
        assert!(matches!(result, Err(Error::CaptureFailed(_))));
        assert!(driver.signaling.is_none());
        assert_eq!(driver.state, SessionState::Idle);

        let events = drain(&mut out_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, RoomEvent::Notice { message } if message.contains("camera"))));
    }

    #[tokio::test]
    async fn test_call_without_channel_is_rejected() {
        let mut h = harness();
        let result = h.driver.handle_call("b".to_string()).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(h.driver.registry.is_empty());
    }

    #[tokio::test]
    async fn test_chat_without_open_channel_is_an_error() {
        let mut h = harness();
        let result = h.driver.handle_send_chat("hi".to_string()).await;
        assert!(matches!(result, Err(Error::DataChannelError(_))));
    }

    #[tokio::test]
    async fn test_screen_share_ended_event_stops_share() {
        let mut h = harness();
        h.driver.media.acquire().await.unwrap();
        h.driver.handle_start_screen_share().await.unwrap();
        assert!(h.driver.media.is_screen_sharing());
        drain(&mut h.out_rx);

        h.driver.dispatch(DriverEvent::ScreenShareEnded).await;

        assert!(!h.driver.media.is_screen_sharing());
        let events = drain(&mut h.out_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, RoomEvent::ScreenShareChanged { active: false })));
    }

    #[tokio::test]
    async fn test_hang_up_keeps_members_but_clears_peers() {
        let mut h = harness();
        let sdp = real_offer_sdp().await;
        h.driver
            .dispatch(DriverEvent::Signal(Envelope::Offer {
                room: "r1".into(),
                from: "b".into(),
                to: "self".into(),
                sdp,
            }))
            .await;
        h.driver
            .dispatch(DriverEvent::Signal(Envelope::RoomMembers {
                room: "r1".into(),
                members: vec!["self".into(), "b".into()],
            }))
            .await;

        h.driver.handle_hang_up().await.unwrap();

        assert!(h.driver.registry.is_empty());
        assert_eq!(h.driver.members, vec!["self".to_string(), "b".to_string()]);
    }
}
