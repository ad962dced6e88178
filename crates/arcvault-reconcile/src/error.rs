//! Reconciliation errors.

use arcvault_cluster::ClusterError;
use thiserror::Error;

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A listing round could not be run at all.
    #[error("listing {replica} failed: {source}")]
    Listing {
        replica: String,
        #[source]
        source: ClusterError,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
