//! Error types for batch coordination and node runtime.

use arcvault_batch::BatchError;
use arcvault_bitarchive::BitarchiveError;
use arcvault_journal::JournalError;
use thiserror::Error;

use crate::{HandlerRole, MessageKind};

/// Cluster errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Malformed caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A handler was offered a message kind outside its capabilities.
    #[error("{role} may not handle {kind} messages")]
    PermissionDenied { role: HandlerRole, kind: MessageKind },

    /// The message bus could not accept a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// The wait was abandoned because the process is shutting down.
    #[error("shut down while waiting for batch round")]
    ShutDown,

    /// A node store cannot run the requested job.
    #[error("unsupported batch job: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Bitarchive(#[from] BitarchiveError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Internal invariant failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub(crate) fn poisoned() -> Self {
        Self::Internal("lock poisoned".to_string())
    }
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
