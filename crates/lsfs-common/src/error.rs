//! Error types for lsfs
//!
//! This module defines the common error types used by the metadata-file
//! layers. Errors are plain values handed back to the caller; retry policy
//! belongs to the surrounding filesystem.

use std::io::ErrorKind;
use thiserror::Error;

/// Common result type for lsfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for lsfs
#[derive(Debug, Error)]
pub enum Error {
    /// Backing read/write failure, passed through unchanged
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocation failure while bringing a block into memory
    #[error("out of memory: failed to allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// A bookkeeping rule of the atime file would be broken
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("block not found: {block}")]
    BlockNotFound { block: u64 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if the caller may reasonably retry the operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock),
            _ => false,
        }
    }

    /// Check if this error reports broken atime-file bookkeeping
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::BlockNotFound { .. })
    }
}
