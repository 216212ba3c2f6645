//! Minimal room client: joins a room, calls every member it discovers,
//! and prints session events.
//!
//! Run a relay, then:
//!
//! ```text
//! cargo run --example room_demo -- ws://127.0.0.1:8080/ws demo-room
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use roomlink_client::{PeerId, RoomClient, RoomEvent, SessionConfig, SyntheticCapture};

#[tokio::main]
async fn main() -> roomlink_client::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "ws://127.0.0.1:8080/ws".to_string());
    let room = args.next().unwrap_or_else(|| "demo".to_string());

    let config = SessionConfig::new(url);
    let (handle, mut events) = RoomClient::spawn(config, Arc::new(SyntheticCapture::new()));

    println!("self id: {}", handle.self_id());
    handle.join(room).await?;

    let mut called: HashSet<PeerId> = HashSet::new();
    while let Some(event) = events.recv().await {
        match event {
            RoomEvent::StateChanged(state) => println!("state: {}", state.as_str()),
            RoomEvent::MembersChanged(members) => {
                println!("members: [{}]", members.join(", "));
                for member in members {
                    if member != *handle.self_id() && called.insert(member.clone()) {
                        println!("calling {}", member);
                        if let Err(e) = handle.call(member).await {
                            eprintln!("call failed: {}", e);
                        }
                    }
                }
            }
            RoomEvent::PeerRemoved { peer_id } => println!("peer gone: {}", peer_id),
            RoomEvent::ChatOpened { peer_id } => {
                let _ = handle.send_chat(format!("hello from {}", handle.self_id())).await;
                println!("chat open with {}", peer_id);
            }
            RoomEvent::ChatMessage { peer_id, text } => println!("{}: {}", peer_id, text),
            RoomEvent::Notice { message } => eprintln!("! {}", message),
            _ => {}
        }
    }
    Ok(())
}
