//! Ring state persistence interface.
//!
//! The disk engine itself lives outside this crate; gossip only needs
//! somewhere to put `(ring_id, actor, ring, clock)` snapshots and somewhere
//! to read them back on restart. Flushing is optional: a running cluster
//! never depends on it.

use crate::error::GossipResult;
use async_trait::async_trait;
use clique_core::{HashRing, VectorClock};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One persisted gossip state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingSnapshot {
    /// Ring id the snapshot belongs to.
    pub ring_id: String,
    /// Actor the node was last gossiping under.
    pub actor: String,
    /// The ring.
    pub ring: HashRing,
    /// The vector clock.
    pub clock: VectorClock,
}

/// Where gossip state snapshots go.
#[async_trait]
pub trait RingStore: Send + Sync + 'static {
    /// Persists a snapshot, replacing any previous one.
    async fn save(&self, snapshot: RingSnapshot) -> GossipResult<()>;

    /// Loads the last persisted snapshot, if any.
    async fn load(&self) -> GossipResult<Option<RingSnapshot>>;
}

/// In-process store, the default and the test double.
#[derive(Debug, Default)]
pub struct MemRingStore {
    slot: Mutex<Option<RingSnapshot>>,
}

impl MemRingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RingStore for MemRingStore {
    async fn save(&self, snapshot: RingSnapshot) -> GossipResult<()> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(snapshot);
        }
        Ok(())
    }

    async fn load(&self) -> GossipResult<Option<RingSnapshot>> {
        Ok(self.slot.lock().map(|slot| slot.clone()).unwrap_or(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clique_core::Node;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = MemRingStore::new();
        assert!(store.load().await.unwrap().is_none());

        let mut ring = HashRing::new(3, 2);
        ring.insert(&Node::new("a", "localhost", 8000), None);
        store
            .save(RingSnapshot {
                ring_id: "r".to_string(),
                actor: "actor".to_string(),
                ring: ring.clone(),
                clock: VectorClock::new(),
            })
            .await
            .unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.ring_id, "r");
        assert_eq!(loaded.ring, ring);
    }
}
