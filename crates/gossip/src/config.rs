//! Gossip configuration.

use clique_core::VectorClockOpts;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default virtual copies per node.
pub const DEFAULT_RFACTOR: u32 = 3;
/// Default neighbor cap for ring walks.
pub const DEFAULT_PFACTOR: u32 = 2;
/// Default gossip poll interval.
pub const POLL_INTERVAL_MS: u64 = 1_000;
/// Default state flush interval.
pub const FLUSH_INTERVAL_MS: u64 = 1_000;
/// How many peers each gossip round fans out to.
pub const GOSSIP_FANOUT: usize = 2;

/// Gossip service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Virtual copies per node; must match across the cluster.
    pub rfactor: u32,

    /// Neighbor cap for `next`/`prev`; must match across the cluster.
    pub pfactor: u32,

    /// Interval between gossip rounds.
    pub interval: Duration,

    /// Interval between ring-state flushes, when a store is configured.
    pub flush_interval: Duration,

    /// Bounds for periodic vector clock trimming.
    pub vclock_opts: VectorClockOpts,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            rfactor: DEFAULT_RFACTOR,
            pfactor: DEFAULT_PFACTOR,
            interval: Duration::from_millis(POLL_INTERVAL_MS),
            flush_interval: Duration::from_millis(FLUSH_INTERVAL_MS),
            vclock_opts: VectorClockOpts::default(),
        }
    }
}

impl GossipConfig {
    /// Sets the ring replication factor.
    pub fn with_rfactor(mut self, rfactor: u32) -> Self {
        self.rfactor = rfactor;
        self
    }

    /// Sets the neighbor cap.
    pub fn with_pfactor(mut self, pfactor: u32) -> Self {
        self.pfactor = pfactor;
        self
    }

    /// Sets the gossip round interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }
}
