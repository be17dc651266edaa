//! VFS error types.

use std::io;

use collfs_keep::KeepError;
use thiserror::Error;

use crate::manifest::ManifestError;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path, identifier, or parent does not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// Creation collides with an existing node or identifier.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed path.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Structurally disallowed request.
    #[error("{0}: invalid operation")]
    InvalidOperation(String),

    /// Backend authorization failure, or write through a read-only handle.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A signed locator outlived its TTL.
    #[error("signature expired: {0}")]
    Expired(String),

    /// Sync could not satisfy the storage class policy.
    #[error("storage class unsatisfiable: {0}")]
    StorageClassUnsatisfiable(String),

    /// The collection changed underneath a commit.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Collection is read-only (loaded by portable data hash).
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Deadline elapsed during a backend call.
    #[error("operation timed out")]
    TimedOut,

    /// Manifest text could not be parsed or produced.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an InvalidOperation error.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the caller may retry after re-authorizing or waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VfsError::PermissionDenied(_)
                | VfsError::Expired(_)
                | VfsError::Cancelled
                | VfsError::TimedOut
        )
    }
}

impl From<KeepError> for VfsError {
    fn from(e: KeepError) -> Self {
        match e {
            KeepError::NotFound(msg) => VfsError::NotFound(msg),
            KeepError::PermissionDenied(msg) => VfsError::PermissionDenied(msg),
            KeepError::Expired(msg) => VfsError::Expired(msg),
            KeepError::Conflict(msg) => VfsError::Conflict(msg),
            KeepError::StorageClassUnsatisfiable(msg) => VfsError::StorageClassUnsatisfiable(msg),
            KeepError::Cancelled => VfsError::Cancelled,
            KeepError::TimedOut => VfsError::TimedOut,
            KeepError::Io(e) => VfsError::Io(e),
            other => VfsError::Other(other.to_string()),
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::InvalidOperation(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            VfsError::PermissionDenied(msg) | VfsError::Expired(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::ReadOnly => {
                io::Error::new(io::ErrorKind::PermissionDenied, "filesystem is read-only")
            }
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "operation cancelled"),
            VfsError::TimedOut => io::Error::new(io::ErrorKind::TimedOut, "operation timed out"),
            VfsError::Manifest(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            VfsError::Io(e) => e,
            e @ (VfsError::StorageClassUnsatisfiable(_)
            | VfsError::Conflict(_)
            | VfsError::Other(_)) => io::Error::other(e.to_string()),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
