//! Replica coordination for arcvault.
//!
//! Provides the moving parts between a coordinator and its storage nodes:
//! - [`Message`] and the capability table that says who may handle what
//! - The [`Transport`] seam and the in-process [`LocalBus`]
//! - Heartbeat-based [`LivenessTracker`]
//! - [`BatchCoordinator`], which fans a job out to the live nodes of a
//!   replica and merges their replies under a timeout
//! - [`StorageNode`], the node-side runtime over a [`BatchTarget`]
//!
//! Nothing here is global: the process context owns one tracker and one
//! coordinator and hands out references.

mod coordinator;
mod error;
mod liveness;
mod message;
mod node;
mod target;
mod transport;

pub use coordinator::{
    AggregatedBatchResult, BatchCoordinator, CoordinatorConfig, FailedFile, RoundStatus,
};
pub use error::{ClusterError, Result};
pub use liveness::LivenessTracker;
pub use message::{
    BatchReply, DispatchBatch, HandlerRole, HeartBeat, Message, MessageKind, TerminateBatch,
    can_handle, check_capability,
};
pub use node::{NodeConfig, StorageNode};
pub use target::BatchTarget;
pub use transport::{Destination, LocalBus, Transport};
