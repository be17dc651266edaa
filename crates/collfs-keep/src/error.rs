//! Errors returned across the backing store boundary.

use std::io;
use thiserror::Error;

/// Backing store error type.
#[derive(Debug, Error)]
pub enum KeepError {
    /// Block, collection, project or user not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid authorization.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A signed locator outlived its TTL.
    #[error("signature expired: {0}")]
    Expired(String),

    /// The collection changed underneath a commit.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested storage classes could not be honored.
    #[error("storage class unsatisfiable: {0}")]
    StorageClassUnsatisfiable(String),

    /// Bytes did not hash to the claimed locator.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Malformed locator text.
    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    /// Caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Deadline elapsed before the backend answered.
    #[error("operation timed out")]
    TimedOut,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl KeepError {
    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(what: impl Into<String>) -> Self {
        Self::PermissionDenied(what.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether a caller may reasonably retry after re-authorizing or waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeepError::PermissionDenied(_)
                | KeepError::Expired(_)
                | KeepError::Cancelled
                | KeepError::TimedOut
        )
    }
}

/// Backing store result type.
pub type KeepResult<T> = Result<T, KeepError>;
