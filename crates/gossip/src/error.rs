//! Error types for the gossip crate.

use thiserror::Error;

/// Errors produced by the gossip service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GossipError {
    /// An operation was attempted before `start`
    #[error("gossip is not started")]
    NotStarted,

    /// Ring state error
    #[error(transparent)]
    Core(#[from] clique_core::CoreError),

    /// Transport error
    #[error(transparent)]
    Network(#[from] clique_network::NetworkError),

    /// Persistence failure
    #[error("ring store failure: {reason}")]
    Store { reason: String },
}

/// Result type for gossip operations
pub type GossipResult<T> = Result<T, GossipError>;
