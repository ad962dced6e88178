//! # arcvault-batch: Batch jobs over archive files
//!
//! A batch job is a filename predicate plus a per-file function, with an
//! optional merge step over the combined output. Jobs are described by a
//! serializable [`BatchJobSpec`] so they can be broadcast to every storage
//! node of a replica; each node instantiates the job through a
//! [`JobRegistry`], runs it over its local files with [`run_local`], and
//! ships the output back as a single-use [`RemoteFile`].
//!
//! ```text
//! coordinator                         node
//! ───────────                         ────
//! BatchJobSpec ──── broadcast ──────▶ JobRegistry::instantiate
//!                                     run_local(job, filter, files)
//! aggregate   ◀──── RemoteFile ────── LocalRunOutcome + output
//! post_process(aggregate)
//! ```

mod error;
mod job;
mod remote;
mod runner;
mod spec;

pub use error::{BatchError, Result};
pub use job::{BatchJob, ChecksumJob, FileListJob, JobRegistry};
pub use remote::RemoteFile;
pub use runner::{
    DEFAULT_MAX_EXCEPTIONS, ExceptionOccurrence, FailurePhase, LocalRunOutcome, run_local,
};
pub use spec::{BatchJobSpec, EVERYTHING_PATTERN, FilenameFilter, JobKind};
