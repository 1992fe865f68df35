//! Error types for the node crate.

use thiserror::Error;

/// Errors produced by cluster node lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The ring id restored from disk differs from the configured one
    #[error("restored ring id {restored} does not match configured {configured}")]
    RingMismatch {
        restored: String,
        configured: String,
    },

    /// Gossip error
    #[error(transparent)]
    Gossip(#[from] clique_gossip::GossipError),

    /// Transport error
    #[error(transparent)]
    Network(#[from] clique_network::NetworkError),
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
