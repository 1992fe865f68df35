//! # Clique Gossip
//!
//! Ring membership by gossip: every node owns a consistent hash ring and a
//! vector clock, periodically exchanges them with random peers, and
//! reconciles received state by causal descent with last-write-wins conflict
//! resolution. Topology commands (`meet`, `insert`, `remove`, `leave`)
//! mutate the ring under fresh actors and fan the change out.

// Module declarations
pub mod config;
pub mod error;
pub mod gossip;
pub mod messages;
pub mod store;

// Re-exports
pub use config::GossipConfig;
pub use error::{GossipError, GossipResult};
pub use gossip::{Gossip, GossipEvent};
pub use messages::{RingMsg, RingMsgKind};
pub use store::{MemRingStore, RingSnapshot, RingStore};
