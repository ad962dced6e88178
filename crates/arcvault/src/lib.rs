//! # arcvault
//!
//! Replicated preservation archive: files are stored in several independent
//! replicas, a checksum journal records what each file must hash to, and
//! batch jobs run over every live node of a replica without addressing
//! servers individually.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── ArchiveContext ────────────────────────────┐
//! │  ChecksumJournal        LivenessTracker ◄── heartbeats                 │
//! │        ▲                       │                                       │
//! │        │                       ▼                                       │
//! │  ReplicaReconciler ──► BatchCoordinator ──► Transport ──► StorageNode  │
//! │        │                       ▲                              │        │
//! │        ▼                       └───────── BatchReply ◄────────┘        │
//! │    RepairPlan                                                          │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - **Process context**: [`ArchiveContext`] owns the journal, the tracker
//!   and the coordinator
//! - **Storage**: [`ChecksumJournal`], [`Bitarchive`]
//! - **Coordination**: [`BatchCoordinator`], [`StorageNode`], [`LocalBus`]
//! - **Comparison**: [`ReplicaReconciler`], [`RepairPlan`]

mod context;
mod error;

pub use context::ArchiveContext;
pub use error::{ArchiveError, Result};

pub use arcvault_batch::{BatchJob, BatchJobSpec, JobKind, JobRegistry, RemoteFile};
pub use arcvault_bitarchive::{ArchiveRecordHandle, Bitarchive, BitarchiveOptions};
pub use arcvault_cluster::{
    AggregatedBatchResult, BatchCoordinator, BatchTarget, LivenessTracker, LocalBus, Message,
    RoundStatus, StorageNode, Transport,
};
pub use arcvault_config::{ArchiveConfig, ConfigLoader};
pub use arcvault_journal::{ChecksumEntry, ChecksumJournal, EntryState, JournalOptions};
pub use arcvault_reconcile::{
    FileClassification, ReconciliationReport, RepairAction, RepairPlan, ReplicaReconciler,
};
pub use arcvault_types::{
    Checksum, FILENAME_CHECKSUM_SEPARATOR, NodeId, Replica, ReplicaId, ReplicaKind,
    StorageNodeIdentity, Timestamp,
};
