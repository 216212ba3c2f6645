//! In-process signaling relay for integration tests
//!
//! Speaks the production wire contract: tracks room occupancy from
//! `join`/`leave`, pushes a full `room_members` roster snapshot to every
//! occupant on each change, and forwards `offer`/`answer`/`candidate`
//! envelopes verbatim to their `to` target. Connection loss counts as a
//! leave.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use roomlink_proto::Envelope;

type Members = HashMap<String, mpsc::UnboundedSender<String>>;
type Rooms = Arc<Mutex<HashMap<String, Members>>>;

/// A live relay bound to an ephemeral local port.
pub struct TestRelay {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestRelay {
    /// Bind and start accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
        let conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let tasks = Arc::clone(&conn_tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let rooms = Arc::clone(&rooms);
                let handle = tokio::spawn(handle_connection(stream, rooms));
                tasks.lock().await.push(handle);
            }
        });

        Self {
            addr,
            accept_task,
            conn_tasks,
        }
    }

    /// WebSocket URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Kill the listener and every live connection, simulating an
    /// unexpected relay outage.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        for task in self.conn_tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn handle_connection(stream: TcpStream, rooms: Rooms) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    // Writer side mirrors the production relay: a per-client outbox.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Set once the client joins; cleared by an explicit leave.
    let mut identity: Option<(String, String)> = None;

    while let Some(Ok(frame)) = source.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
            continue;
        };
        match envelope {
            Envelope::Join { room, from } => {
                identity = Some((room.clone(), from.clone()));
                let mut rooms = rooms.lock().await;
                let members = rooms.entry(room.clone()).or_default();
                members.insert(from, tx.clone());
                broadcast_roster(&room, members);
            }
            Envelope::Leave { .. } => {
                if let Some((room, id)) = identity.take() {
                    remove_member(&rooms, &room, &id).await;
                }
            }
            Envelope::Ping { .. } => {}
            Envelope::Offer { room, to, .. }
            | Envelope::Answer { room, to, .. }
            | Envelope::Candidate { room, to, .. } => {
                forward(&rooms, &room, &to, text).await;
            }
            Envelope::RoomMembers { .. } => {}
        }
    }

    writer.abort();
    if let Some((room, id)) = identity {
        remove_member(&rooms, &room, &id).await;
    }
}

async fn forward(rooms: &Rooms, room: &str, to: &str, text: String) {
    let rooms = rooms.lock().await;
    if let Some(members) = rooms.get(room) {
        if let Some(target) = members.get(to) {
            let _ = target.send(text);
        }
    }
}

fn broadcast_roster(room: &str, members: &Members) {
    let roster = Envelope::RoomMembers {
        room: room.to_string(),
        members: members.keys().cloned().collect(),
    };
    let Ok(text) = serde_json::to_string(&roster) else {
        return;
    };
    for member in members.values() {
        let _ = member.send(text.clone());
    }
}

async fn remove_member(rooms: &Rooms, room: &str, id: &str) {
    let mut rooms = rooms.lock().await;
    if let Some(members) = rooms.get_mut(room) {
        members.remove(id);
        if members.is_empty() {
            rooms.remove(room);
        } else {
            broadcast_roster(room, members);
        }
    }
}
