//! Error types for the coordination crate.

use thiserror::Error;

/// Errors produced by the lock and semaphore managers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// A lock request exhausted its retries without reaching quorum
    #[error("quorum failure for lock {id}")]
    QuorumFailure { id: String },

    /// A semaphore operation targeted an id that does not exist
    #[error("semaphore {id} does not exist")]
    SemaphoreMissing { id: String },

    /// A post exhausted its retries against a full semaphore
    #[error("semaphore {id} is full")]
    SemaphoreFull { id: String },

    /// A create named an existing semaphore with a different size
    #[error("semaphore {id} already exists with size {existing}, requested {requested}")]
    SemaphoreSizeConflict {
        id: String,
        existing: u32,
        requested: u32,
    },

    /// An operation was attempted before `start`
    #[error("manager is not started")]
    NotStarted,

    /// No replica nodes are known for the requested key
    #[error("no replicas available for {id}")]
    NoReplicas { id: String },

    /// Transport error
    #[error(transparent)]
    Network(#[from] clique_network::NetworkError),

    /// A peer sent a malformed response
    #[error("malformed response: {reason}")]
    BadResponse { reason: String },
}

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

impl CoordinationError {
    /// Wraps a response decoding failure.
    pub fn bad_response(err: impl std::fmt::Display) -> Self {
        Self::BadResponse {
            reason: err.to_string(),
        }
    }
}
