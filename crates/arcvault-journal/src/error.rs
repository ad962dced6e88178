//! Journal error types.

use std::path::PathBuf;

use arcvault_batch::BatchError;
use arcvault_types::{Checksum, InvalidValue};
use thiserror::Error;

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, JournalError>;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Malformed caller input (empty or reserved filename, missing source).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No current completed entry exists for the filename.
    #[error("unknown file '{0}': no completed upload is recorded")]
    UnknownFile(String),

    /// A protocol violation, such as correcting a file that was never uploaded.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// An upload attempt ended in `UPLOAD_FAILED`. The caller may retry.
    #[error("upload of '{filename}' failed: {reason}")]
    UploadFailed { filename: String, reason: String },

    /// The written copy did not hash to the source checksum.
    #[error("checksum mismatch for '{filename}': expected {expected}, wrote {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: Checksum,
        actual: Checksum,
    },

    /// The capacity guard refused the write.
    #[error("insufficient space in {dir}: {available} bytes available, {required} required")]
    InsufficientSpace {
        dir: PathBuf,
        available: u64,
        required: u64,
    },

    /// A persisted line could not be parsed.
    #[error("corrupt journal {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Another process holds the journal's writer lock.
    #[error("journal {0} is locked by another process")]
    Locked(PathBuf),

    /// Internal invariant failure (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl JournalError {
    pub(crate) fn poisoned() -> Self {
        Self::Internal("lock poisoned".to_string())
    }
}

impl From<InvalidValue> for JournalError {
    fn from(err: InvalidValue) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<BatchError> for JournalError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Io(e) => Self::Io(e),
            BatchError::IllegalState(msg) => Self::IllegalState(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}
