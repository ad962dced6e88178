//! Bitarchive error types.

use std::path::PathBuf;

use arcvault_batch::BatchError;
use arcvault_journal::JournalError;
use arcvault_types::{Checksum, InvalidValue};
use thiserror::Error;

/// Result type for bitarchive operations.
pub type Result<T> = std::result::Result<T, BitarchiveError>;

#[derive(Debug, Error)]
pub enum BitarchiveError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file '{0}' is not stored in this bitarchive")]
    UnknownFile(String),

    #[error("file '{0}' is already stored in this bitarchive")]
    AlreadyStored(String),

    /// Protocol violation, such as a second read of a released record handle.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("checksum mismatch for '{filename}': expected {expected}, stored copy has {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: Checksum,
        actual: Checksum,
    },

    /// The bytes at the requested offset are not a well-formed record.
    #[error("no valid record in '{filename}' at offset {offset}: {reason}")]
    InvalidRecord {
        filename: String,
        offset: u64,
        reason: String,
    },

    #[error("insufficient space in {dir}: {available} bytes available, {required} required")]
    InsufficientSpace {
        dir: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BitarchiveError {
    pub(crate) fn poisoned() -> Self {
        Self::Internal("lock poisoned".to_string())
    }
}

impl From<InvalidValue> for BitarchiveError {
    fn from(err: InvalidValue) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<BatchError> for BitarchiveError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Io(e) => Self::Io(e),
            BatchError::IllegalState(msg) => Self::IllegalState(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<JournalError> for BitarchiveError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::InsufficientSpace {
                dir,
                available,
                required,
            } => Self::InsufficientSpace {
                dir,
                available,
                required,
            },
            JournalError::Io(e) => Self::Io(e),
            other => Self::Internal(other.to_string()),
        }
    }
}
