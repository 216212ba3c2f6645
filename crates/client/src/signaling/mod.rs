//! Signaling channel
//!
//! One WebSocket connection to the relay. The channel sends the `join`
//! envelope as its first frame, keeps the connection alive with periodic
//! `ping` envelopes, forwards every inbound envelope into the session
//! dispatch queue, and reports exactly one close event — tagged with
//! whether the close was user-initiated — when the connection ends.
//!
//! `send` is fire-and-forget by contract: an envelope handed to a channel
//! that is no longer open is dropped silently, never queued, never
//! retried. Reconnection is a user decision (an explicit re-join), not an
//! automatic behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use crate::session::DriverEvent;
use crate::{Error, Result, SessionConfig};

use roomlink_proto::{Envelope, PeerId};

/// Instructions for the writer task.
enum Outbound {
    Envelope(Envelope),
    Close,
}

/// The single bidirectional connection to the relay.
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    manual_close: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

impl SignalingChannel {
    /// Open the channel, send the `join` envelope, start the reader and
    /// keepalive tasks. The orchestrator holds at most one channel;
    /// repeated connect intents while one is open are its no-ops, not
    /// ours.
    pub(crate) async fn connect(
        config: &SessionConfig,
        room: &str,
        self_id: &PeerId,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> Result<Self> {
        let (ws, _response) = connect_async(config.signaling_url.as_str())
            .await
            .map_err(|e| Error::SignalingError(format!("Failed to connect to relay: {}", e)))?;
        debug!("Signaling channel open: {}", config.signaling_url);

        let (mut sink, mut stream) = ws.split();

        // The join envelope is the first frame on the wire.
        let join = Envelope::Join {
            room: room.to_string(),
            from: self_id.clone(),
        };
        sink.send(Message::Text(serde_json::to_string(&join)?))
            .await
            .map_err(|e| Error::SignalingError(format!("Failed to send join: {}", e)))?;

        let open = Arc::new(AtomicBool::new(true));
        let manual_close = Arc::new(AtomicBool::new(false));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

        // Writer: serializes envelopes onto the socket. Exits on the close
        // instruction, on a write error, or when every sender is gone.
        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(out) = outbound_rx.recv().await {
                match out {
                    Outbound::Envelope(envelope) => {
                        let text = match serde_json::to_string(&envelope) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode {} envelope: {}", envelope.name(), e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!("Signaling write failed: {}", e);
                            writer_open.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Keepalive: a ping envelope every interval while the channel is
        // open, to survive idle-timeout infrastructure between us and the
        // relay.
        let keepalive_open = Arc::clone(&open);
        let keepalive_tx = outbound_tx.clone();
        let ping = Envelope::Ping {
            room: room.to_string(),
            from: self_id.clone(),
        };
        let interval = config.ping_interval;
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                if !keepalive_open.load(Ordering::SeqCst) {
                    break;
                }
                if keepalive_tx.send(Outbound::Envelope(ping.clone())).is_err() {
                    break;
                }
            }
        });

        // Reader: parses inbound envelopes into the dispatch queue and
        // reports the close. Unreadable messages are logged and skipped,
        // never fatal.
        let reader_open = Arc::clone(&open);
        let reader_manual = Arc::clone(&manual_close);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            trace!("Inbound {} envelope", envelope.name());
                            if events.send(DriverEvent::Signal(envelope)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping unreadable signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Relay closed the signaling channel");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling read error: {}", e);
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = events.send(DriverEvent::SignalingClosed {
                manual: reader_manual.load(Ordering::SeqCst),
            });
        });

        Ok(Self {
            outbound: outbound_tx,
            open,
            manual_close,
            reader,
            keepalive,
        })
    }

    /// Whether the channel is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Hand an envelope to the channel, fire-and-forget. If the channel is
    /// not open the envelope is dropped silently by contract — no queue,
    /// no retry.
    pub fn send(&self, envelope: Envelope) {
        if !self.is_open() {
            trace!("Dropping {} envelope, channel not open", envelope.name());
            return;
        }
        let _ = self.outbound.send(Outbound::Envelope(envelope));
    }

    /// Deliberately close the channel. Marks the close as user-initiated
    /// so the resulting close event is not surfaced as an error, and stops
    /// the keepalive immediately.
    pub fn close(&self) {
        self.manual_close.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        // The writer is left to drain any queued leave/close frames; it
        // exits once its senders are gone.
        self.reader.abort();
        self.keepalive.abort();
    }
}
