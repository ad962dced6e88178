//! Errors surfaced by the process context.

use arcvault_bitarchive::BitarchiveError;
use arcvault_cluster::ClusterError;
use arcvault_config::ConfigError;
use arcvault_journal::JournalError;
use arcvault_reconcile::ReconcileError;
use thiserror::Error;

/// Result type for [`crate::ArchiveContext`] operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Bitarchive(#[from] BitarchiveError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// Every upload attempt failed.
    #[error("upload of {filename} failed after {attempts} attempts: {last}")]
    UploadExhausted {
        filename: String,
        attempts: u32,
        #[source]
        last: JournalError,
    },
}
