//! Gossip wire messages.

use clique_core::{HashRing, VectorClock};
use serde::{Deserialize, Serialize};

/// What a ring message announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RingMsgKind {
    /// A node asks to be merged into the ring
    Join,
    /// Periodic or triggered state exchange
    Update,
    /// A node announces a ring that no longer contains it
    Leave,
}

/// Payload of the `ring` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingMsg {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: RingMsgKind,
    /// Actor the receiver bumps its clock under.
    pub actor: String,
    /// The sender's view of the ring.
    pub data: HashRing,
    /// The sender's vector clock.
    pub vclock: VectorClock,
    /// Remaining rebroadcast rounds.
    pub round: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clique_core::Node;

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RingMsgKind::Join).unwrap(),
            "\"join\""
        );
        assert_eq!(
            serde_json::to_string(&RingMsgKind::Leave).unwrap(),
            "\"leave\""
        );
    }

    #[test]
    fn message_round_trips() {
        let mut ring = HashRing::new(3, 2);
        ring.insert(&Node::new("a", "localhost", 8000), None);
        let mut clock = VectorClock::new();
        clock.increment("actor-1");

        let msg = RingMsg {
            kind: RingMsgKind::Update,
            actor: "actor-1".to_string(),
            data: ring.clone(),
            vclock: clock.clone(),
            round: 1,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RingMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, RingMsgKind::Update);
        assert_eq!(back.data, ring);
        assert_eq!(back.vclock, clock);
        assert_eq!(back.round, 1);
    }
}
