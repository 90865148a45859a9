//! Error types for depot
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::codec::CodecError;
use crate::readonly::ImmutabilityViolation;
use crate::types::Serial;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for depot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for depot
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error outside a commit
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Value encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Mutation of a frozen value
    #[error("Immutability violation: {0}")]
    Immutability(#[from] ImmutabilityViolation),

    /// File commit, rollback or recovery failed
    #[error("Commit failed: {0}")]
    Commit(#[from] CommitError),

    /// Another write transaction is active, or the backend moved underneath us
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// The worker pool is shutting down
    #[error("Shutdown in progress")]
    Shutdown,

    /// Backend could not be reached; the operation may be retried
    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend reported a non-transient failure
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Write attempted on a read-only store
    #[error("Store is read-only")]
    ReadOnly,

    /// Value does not match the kind its key declares
    #[error("Type mismatch for {key}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Key relpath
        key: String,
        /// Kind the key declares
        expected: &'static str,
        /// Kind of the offending value
        actual: &'static str,
    },

    /// Malformed key pattern, parameters or relpath
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key is not registered or not present
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Imported changes do not start at the next local serial
    #[error("Replication gap: expected serial {expected}, got {actual}")]
    ReplicationGap {
        /// Next serial the store would accept
        expected: Serial,
        /// Serial that was offered
        actual: Serial,
    },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Backend failure that may go away on retry
    pub fn unavailable(msg: impl fmt::Display) -> Self {
        Error::BackendUnavailable(msg.to_string())
    }

    /// Backend failure that will not go away on retry
    pub fn backend(msg: impl fmt::Display) -> Self {
        Error::Backend(msg.to_string())
    }

    /// Whether the caller may retry the operation unchanged
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_) | Error::WriteConflict(_))
    }
}

/// Failure while committing, rolling back or recovering staged files
#[derive(Debug, Error)]
pub enum CommitError {
    /// Filesystem operation failed
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path the operation touched
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Neither the staged file nor its destination exists
    #[error("staged file for {} is missing and the destination does not exist", .0.display())]
    MissingFile(PathBuf),

    /// The intent record could not be parsed
    #[error("corrupt intent record: {0}")]
    CorruptIntent(String),

    /// The intent record could not be encoded
    #[error("cannot encode intent record: {0}")]
    Encoding(#[from] CodecError),

    /// Relative path escapes the base directory or collides with staging names
    #[error("invalid path {0:?}")]
    InvalidPath(String),
}

impl CommitError {
    /// Attach a path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CommitError::Io {
            path: path.into(),
            source,
        }
    }
}
