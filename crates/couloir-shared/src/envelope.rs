//! Signaling wire envelopes.
//!
//! Every message between a client and the relay is one JSON object whose
//! `type` field discriminates the variant. The relay fills the `from` field
//! when it forwards a targeted envelope; clients fill `target` when they
//! send one. Payloads are opaque to the relay.

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::types::{PeerEntry, Room, RoomKind, UserId};

/// Invite payload: enough for the recipient to create the room and derive
/// session keys against the inviter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvitePayload {
    pub name: String,
    #[serde(rename = "roomType")]
    pub room_type: RoomKind,
    pub pubkey: PublicKey,
}

/// Ack payload: the finalized room, sent back to the inviter on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckPayload {
    pub room: Room,
}

/// Connection-negotiation payload. Offers and answers carry `sdp`;
/// candidate-carrying signal messages carry `candidate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

impl SignalPayload {
    pub fn sdp(sdp: impl Into<String>) -> Self {
        Self {
            sdp: Some(sdp.into()),
            candidate: None,
        }
    }

    pub fn candidate(candidate: impl Into<String>) -> Self {
        Self {
            sdp: None,
            candidate: Some(candidate.into()),
        }
    }
}

/// One signaling envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Join {
        id: UserId,
        username: String,
        pubkey: PublicKey,
    },
    Welcome {
        id: UserId,
        message: String,
    },
    Invite {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
        payload: InvitePayload,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
        payload: AckPayload,
    },
    Peers {
        #[serde(default)]
        peers: Vec<PeerEntry>,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
        payload: SignalPayload,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
        payload: SignalPayload,
    },
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
        payload: SignalPayload,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<UserId>,
        payload: SignalPayload,
    },
    Error {
        message: String,
    },
}

/// Dispatch key for an envelope, used by handler registries and the relay's
/// routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Join,
    Welcome,
    Invite,
    Ack,
    Peers,
    Offer,
    Answer,
    Signal,
    Candidate,
    Error,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnvelopeKind::Join => "join",
            EnvelopeKind::Welcome => "welcome",
            EnvelopeKind::Invite => "invite",
            EnvelopeKind::Ack => "ack",
            EnvelopeKind::Peers => "peers",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Signal => "signal",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::Error => "error",
        };
        write!(f, "{name}")
    }
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Join { .. } => EnvelopeKind::Join,
            Envelope::Welcome { .. } => EnvelopeKind::Welcome,
            Envelope::Invite { .. } => EnvelopeKind::Invite,
            Envelope::Ack { .. } => EnvelopeKind::Ack,
            Envelope::Peers { .. } => EnvelopeKind::Peers,
            Envelope::Offer { .. } => EnvelopeKind::Offer,
            Envelope::Answer { .. } => EnvelopeKind::Answer,
            Envelope::Signal { .. } => EnvelopeKind::Signal,
            Envelope::Candidate { .. } => EnvelopeKind::Candidate,
            Envelope::Error { .. } => EnvelopeKind::Error,
        }
    }

    /// The identity this envelope is addressed to, if it carries one.
    pub fn target(&self) -> Option<&UserId> {
        match self {
            Envelope::Invite { target, .. }
            | Envelope::Ack { target, .. }
            | Envelope::Offer { target, .. }
            | Envelope::Answer { target, .. }
            | Envelope::Signal { target, .. }
            | Envelope::Candidate { target, .. } => target.as_ref(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::types::RoomId;

    fn pubkey() -> PublicKey {
        KeyPair::generate_static().public()
    }

    #[test]
    fn test_join_wire_shape() {
        let env = Envelope::Join {
            id: UserId::from("u1"),
            username: "alice".to_string(),
            pubkey: pubkey(),
        };

        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["id"], "u1");
        assert_eq!(json["username"], "alice");
        assert_eq!(json["pubkey"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_invite_roundtrip() {
        let env = Envelope::Invite {
            from: None,
            target: Some(UserId::from("u2")),
            payload: InvitePayload {
                name: "alice".to_string(),
                room_type: RoomKind::Single,
                pubkey: pubkey(),
            },
        };

        let text = env.to_json().unwrap();
        assert!(text.contains("\"roomType\":\"single\""));
        // `from` is absent until the relay fills it in.
        assert!(!text.contains("\"from\""));

        let back = Envelope::from_json(&text).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.kind(), EnvelopeKind::Invite);
        assert_eq!(back.target(), Some(&UserId::from("u2")));
    }

    #[test]
    fn test_ack_carries_room() {
        let room = Room {
            id: RoomId::new(),
            name: "alice".to_string(),
            kind: RoomKind::Single,
            members: vec![],
        };
        let env = Envelope::Ack {
            from: Some(UserId::from("u2")),
            target: Some(UserId::from("u1")),
            payload: AckPayload { room: room.clone() },
        };

        match Envelope::from_json(&env.to_json().unwrap()).unwrap() {
            Envelope::Ack { payload, .. } => assert_eq!(payload.room, room),
            other => panic!("expected ack, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_candidate_travels_as_signal() {
        let env = Envelope::Signal {
            from: None,
            target: Some(UserId::from("u2")),
            payload: SignalPayload::candidate("candidate:1 1 udp 2122260223 10.0.0.1 54400"),
        };

        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "signal");
        assert!(json["payload"]["candidate"].is_string());
        assert!(json["payload"].get("sdp").is_none());
    }

    #[test]
    fn test_peers_request_has_empty_list() {
        // A bare `{"type":"peers"}` is the client-side request form.
        let env = Envelope::from_json("{\"type\":\"peers\"}").unwrap();
        match env {
            Envelope::Peers { peers } => assert!(peers.is_empty()),
            other => panic!("expected peers, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_type_is_a_parse_error() {
        assert!(Envelope::from_json("{\"type\":\"bogus\"}").is_err());
        assert!(Envelope::from_json("not json at all").is_err());
    }

    #[test]
    fn test_error_envelope() {
        let env = Envelope::Error {
            message: "Target not found or disconnected".to_string(),
        };
        let text = env.to_json().unwrap();
        assert_eq!(
            text,
            "{\"type\":\"error\",\"message\":\"Target not found or disconnected\"}"
        );
    }
}
