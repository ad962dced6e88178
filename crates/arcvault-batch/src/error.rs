//! Batch error types.

use arcvault_types::InvalidValue;
use thiserror::Error;

/// Result type for batch operations.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Errors that can occur while preparing or running batch jobs.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Malformed caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The job's filename pattern does not compile.
    #[error("invalid filename pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    /// No factory is registered for a custom job name.
    #[error("unknown batch job '{0}'")]
    UnknownJob(String),

    /// A protocol violation, such as reading a released result file twice.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<InvalidValue> for BatchError {
    fn from(err: InvalidValue) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}
