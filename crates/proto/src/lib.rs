//! Relay wire protocol for roomlink
//!
//! Typed envelopes for the JSON signaling protocol spoken between clients
//! and the relay. The relay forwards `offer`/`answer`/`candidate` envelopes
//! to their `to` target verbatim and pushes full `room_members` roster
//! snapshots on every join/leave; `sdp` and `candidate` payloads are opaque
//! blobs that clients pass straight through to their transport layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque peer identity.
///
/// Generated once per process lifetime, never reused. The relay and remote
/// peers treat it as an opaque token.
pub type PeerId = String;

/// Generate a fresh peer identity for this process.
pub fn new_peer_id() -> PeerId {
    uuid::Uuid::new_v4().to_string()
}

/// A signaling envelope as it appears on the wire.
///
/// The `type` field selects the variant; peer-addressed envelopes carry
/// `room`, `from` and (except roster snapshots) `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Sent once immediately after the signaling channel opens.
    Join { room: String, from: PeerId },

    /// Sent before deliberately closing the signaling channel.
    Leave { room: String, from: PeerId },

    /// Periodic keepalive; the relay does not reply.
    Ping { room: String, from: PeerId },

    /// Session-description offer, forwarded untouched to `to`.
    Offer {
        room: String,
        from: PeerId,
        to: PeerId,
        sdp: Value,
    },

    /// Session-description answer, forwarded untouched to `to`.
    Answer {
        room: String,
        from: PeerId,
        to: PeerId,
        sdp: Value,
    },

    /// Connectivity candidate, forwarded untouched to `to`.
    Candidate {
        room: String,
        from: PeerId,
        to: PeerId,
        candidate: Value,
    },

    /// Relay-pushed full roster snapshot (not a diff); always includes the
    /// receiving peer itself.
    RoomMembers {
        #[serde(default)]
        room: String,
        members: Vec<PeerId>,
    },
}

impl Envelope {
    /// Envelope type name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Ping { .. } => "ping",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::RoomMembers { .. } => "room_members",
        }
    }

    /// Originating peer, when the envelope carries one.
    pub fn from(&self) -> Option<&PeerId> {
        match self {
            Self::Join { from, .. }
            | Self::Leave { from, .. }
            | Self::Ping { from, .. }
            | Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::Candidate { from, .. } => Some(from),
            Self::RoomMembers { .. } => None,
        }
    }

    /// Addressed target peer, for `offer`/`answer`/`candidate`.
    pub fn to(&self) -> Option<&PeerId> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => {
                Some(to)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_format() {
        let env = Envelope::Join {
            room: "r1".into(),
            from: "abc123".into(),
        };
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire, json!({"type": "join", "room": "r1", "from": "abc123"}));
    }

    #[test]
    fn test_offer_carries_opaque_sdp() {
        // The sdp blob must survive untouched, whatever shape it has.
        let wire = r#"{"type":"offer","room":"r1","from":"a","to":"b","sdp":{"type":"offer","sdp":"v=0\r\n"}}"#;
        let env: Envelope = serde_json::from_str(wire).unwrap();
        match &env {
            Envelope::Offer { room, from, to, sdp } => {
                assert_eq!(room, "r1");
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(sdp["sdp"], "v=0\r\n");
            }
            other => panic!("parsed as {}", other.name()),
        }
        assert_eq!(env.from().map(String::as_str), Some("a"));
        assert_eq!(env.to().map(String::as_str), Some("b"));
    }

    #[test]
    fn test_room_members_snapshot_as_pushed_by_relay() {
        // The relay includes `room` and an empty `from` on roster pushes;
        // both must be tolerated.
        let wire = r#"{"type":"room_members","room":"r1","from":"","members":["a","b"]}"#;
        let env: Envelope = serde_json::from_str(wire).unwrap();
        assert_eq!(
            env,
            Envelope::RoomMembers {
                room: "r1".into(),
                members: vec!["a".into(), "b".into()],
            }
        );
        assert!(env.to().is_none());
    }

    #[test]
    fn test_room_members_without_room_field() {
        let wire = r#"{"type":"room_members","members":["a"]}"#;
        let env: Envelope = serde_json::from_str(wire).unwrap();
        match env {
            Envelope::RoomMembers { room, members } => {
                assert_eq!(room, "");
                assert_eq!(members, vec!["a".to_string()]);
            }
            other => panic!("parsed as {}", other.name()),
        }
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let wire = r#"{"type":"shrug","room":"r1","from":"a"}"#;
        assert!(serde_json::from_str::<Envelope>(wire).is_err());
    }

    #[test]
    fn test_peer_ids_are_unique_per_call() {
        let a = new_peer_id();
        let b = new_peer_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }
}
