//! Error types for AMT operations

use thiserror::Error;

/// Result type for AMT operations
pub type Result<T> = std::result::Result<T, AmtError>;

/// Errors that can occur in AMT operations
///
/// Nothing here is retried or recovered locally; every error surfaces to
/// the caller. A root observed after an error may hold partially applied
/// in-memory mutation — the safe remediation is to discard it and re-load
/// from a known id.
#[derive(Error, Debug)]
pub enum AmtError {
    /// Index exceeds the addressable range
    #[error("index {index} is out of range for the amt")]
    IndexOutOfRange {
        /// The offending index
        index: u64,
    },

    /// Index not present (strict batch deletion)
    #[error("index {index} not found in the amt")]
    NotFound {
        /// The missing index
        index: u64,
    },

    /// Bit width outside the supported range
    #[error("bit width must be between 1 and 18, is {0}")]
    InvalidBitWidth(u32),

    /// Malformed CBOR at a block boundary
    #[error("decode error: {0}")]
    Decode(String),

    /// A persisted record violates a structural invariant
    #[error("invalid amt: {0}")]
    InvalidShape(String),

    /// Count bookkeeping would overflow or underflow
    #[error("amt count does not match number of elements")]
    InvalidCount,

    /// A parallel worker failed to complete
    #[error("parallel task failed: {0}")]
    Task(String),

    /// Block-store failure, including the typed not-found case
    #[error(transparent)]
    Store(#[from] arbor_core::Error),
}

impl AmtError {
    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an invalid-shape error
    pub fn invalid_shape(msg: impl Into<String>) -> Self {
        Self::InvalidShape(msg.into())
    }
}
