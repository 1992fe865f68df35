//! Error types for the core crate.

use thiserror::Error;

/// Errors produced by the core data structures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Ring merge or intersect attempted between rings with different parameters
    #[error(
        "ring parameter mismatch: local rfactor={local_rfactor} pfactor={local_pfactor}, \
         remote rfactor={remote_rfactor} pfactor={remote_pfactor}"
    )]
    RingParamMismatch {
        local_rfactor: u32,
        local_pfactor: u32,
        remote_rfactor: u32,
        remote_pfactor: u32,
    },

    /// A serialized ring or clock could not be decoded
    #[error("invalid encoding: {reason}")]
    InvalidEncoding { reason: String },
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
