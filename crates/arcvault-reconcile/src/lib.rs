//! Cross-replica comparison for arcvault.
//!
//! ```text
//!   replica A ──FileList──┐
//!   replica B ──FileList──┼──► union of names ──► Checksum per replica
//!   replica C ──FileList──┘                              │
//!                                                        ▼
//!                              classify ──► ReconciliationReport + RepairPlan
//! ```
//!
//! Detection is separate from mutation: the [`RepairPlan`] names what to
//! re-upload or correct, and the caller executes it.

mod classify;
mod error;
mod listing;
mod reconciler;

pub use classify::{
    FileClassification, FileReport, ReconciliationReport, RepairAction, RepairPlan,
    ReplicaChecksum, classify, majority_checksum,
};
pub use error::{ReconcileError, Result};
pub use listing::{ChecksumListing, FileListing};
pub use reconciler::{CoordinatorSource, ReplicaReconciler, ReplicaSource};
