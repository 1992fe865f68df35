//! # Clique Core
//!
//! Shared value types for the clique cluster runtime: node identities,
//! vector clocks, the consistent hash ring, and the monotonic microsecond
//! clock the gossip layer stamps entries with.

// Module declarations
pub mod error;
pub mod node;
pub mod ring;
pub mod time;
pub mod vector_clock;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use node::Node;
pub use ring::HashRing;
pub use time::monotonic_us;
pub use vector_clock::{ClockEntry, VectorClock, VectorClockOpts};
