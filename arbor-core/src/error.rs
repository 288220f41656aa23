//! Error types for arbor-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Block not found in the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid content identifier
    #[error("Invalid content id: {0}")]
    InvalidId(String),

    /// CBOR encode/decode error
    #[error("CBOR error: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an invalid content id error
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Error::InvalidId(msg.into())
    }

    /// Whether this error is the typed not-found case.
    ///
    /// Callers use this to distinguish an absent block from real I/O
    /// failure without matching on the variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
