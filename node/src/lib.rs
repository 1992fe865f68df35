//! # Clique Node
//!
//! Composition layer binding the clique pieces into one runnable cluster
//! node: the network kernel, the gossip service, and the command handler
//! serving the reserved administrative events.

// Module declarations
pub mod cluster;
pub mod command;
pub mod error;

// Re-exports
pub use cluster::ClusterNode;
pub use command::{CommandHandler, COMMAND_HANDLER_ID};
pub use error::{NodeError, NodeResult};
