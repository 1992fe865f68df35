//! Error types for the network crate.

use clique_core::Node;
use thiserror::Error;

/// Network operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// No outbound connection exists for the requested peer
    #[error("no sink for node {node}")]
    NoSink { node: Node },

    /// `reply` was called for a request that carried no tag
    #[error("cannot reply to a request without a tag")]
    NoTag,

    /// A call or stream-assembly deadline expired
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// HMAC verification failed on an inbound frame
    #[error("invalid checksum on frame from {from}")]
    InvalidChecksum { from: Node },

    /// A reply arrived on the expected tag but from an unexpected node
    #[error("reply for tag {tag} expected from {expected}, got {actual}")]
    InvalidReply {
        tag: String,
        expected: Node,
        actual: Node,
    },

    /// Decoded payload failed to parse or type-check
    #[error("invalid job: {reason}")]
    InvalidJob { reason: String },

    /// The connection dropped while an operation was waiting on it
    #[error("disconnected from {node}")]
    Disconnected { node: Node },

    /// The remote stream finished with an error payload
    #[error("remote error: {message}")]
    Remote { message: String },

    /// A handler id is already registered with the kernel
    #[error("handler already registered under id {id}")]
    HandlerExists { id: String },

    /// Frame could not be encoded or decoded
    #[error("frame codec failure: {reason}")]
    Codec { reason: String },

    /// Listener could not be bound
    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    /// Wraps a serde failure into a codec error.
    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec {
            reason: err.to_string(),
        }
    }

    /// Wraps a payload validation failure.
    pub fn invalid_job(err: impl std::fmt::Display) -> Self {
        Self::InvalidJob {
            reason: err.to_string(),
        }
    }
}
