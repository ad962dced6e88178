//! Messages exchanged between the coordinator and storage nodes.
//!
//! Every message is one variant of [`Message`]. Which process may act on which
//! kind is fixed by [`can_handle`]; handlers check it before dispatching and
//! reject anything else with [`ClusterError::PermissionDenied`].
//!
//! | Kind             | Sender      | Handled by   |
//! |------------------|-------------|--------------|
//! | `Dispatch`       | coordinator | storage node |
//! | `TerminateBatch` | coordinator | storage node |
//! | `Reply`          | node        | coordinator  |
//! | `HeartBeat`      | node        | coordinator  |

use std::fmt::Display;

use arcvault_batch::{BatchJobSpec, ExceptionOccurrence, RemoteFile};
use arcvault_types::{ReplicaId, RoundId, StorageNodeIdentity, Timestamp};
use serde::{Deserialize, Serialize};

use crate::{ClusterError, Result};

/// Request to run a job on every node of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchBatch {
    pub round: RoundId,
    pub replica: ReplicaId,
    pub job: BatchJobSpec,
}

/// One node's answer to a [`DispatchBatch`].
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchReply {
    pub round: RoundId,
    pub node: StorageNodeIdentity,
    pub files_processed: usize,
    pub files_failed: Vec<String>,
    pub exceptions: Vec<ExceptionOccurrence>,
    /// The node's partial output; `None` when the run produced no file.
    pub result: Option<RemoteFile>,
}

impl BatchReply {
    /// Whether the node reported any failure.
    pub fn has_failures(&self) -> bool {
        !self.files_failed.is_empty() || !self.exceptions.is_empty()
    }
}

/// Periodic liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeat {
    pub node: StorageNodeIdentity,
    pub timestamp: Timestamp,
}

/// Operator request to stop a running round early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateBatch {
    pub round: RoundId,
    pub replica: ReplicaId,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Message {
    Dispatch(DispatchBatch),
    Reply(BatchReply),
    HeartBeat(HeartBeat),
    TerminateBatch(TerminateBatch),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Dispatch(_) => MessageKind::Dispatch,
            Self::Reply(_) => MessageKind::Reply,
            Self::HeartBeat(_) => MessageKind::HeartBeat,
            Self::TerminateBatch(_) => MessageKind::TerminateBatch,
        }
    }

    /// Copies a broadcastable message. Replies own a single-use result file
    /// and cannot be duplicated.
    pub fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Dispatch(d) => Some(Self::Dispatch(d.clone())),
            Self::HeartBeat(h) => Some(Self::HeartBeat(h.clone())),
            Self::TerminateBatch(t) => Some(Self::TerminateBatch(t.clone())),
            Self::Reply(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Dispatch,
    Reply,
    HeartBeat,
    TerminateBatch,
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Dispatch => "dispatch",
            Self::Reply => "reply",
            Self::HeartBeat => "heartbeat",
            Self::TerminateBatch => "terminate-batch",
        };
        f.write_str(name)
    }
}

/// The part a process plays on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerRole {
    Coordinator,
    StorageNode,
}

impl Display for HandlerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::StorageNode => f.write_str("storage node"),
        }
    }
}

/// The capability table.
pub fn can_handle(role: HandlerRole, kind: MessageKind) -> bool {
    matches!(
        (role, kind),
        (
            HandlerRole::Coordinator,
            MessageKind::Reply | MessageKind::HeartBeat
        ) | (
            HandlerRole::StorageNode,
            MessageKind::Dispatch | MessageKind::TerminateBatch
        )
    )
}

/// Fails with [`ClusterError::PermissionDenied`] unless `role` may handle `message`.
pub fn check_capability(role: HandlerRole, message: &Message) -> Result<()> {
    let kind = message.kind();
    if can_handle(role, kind) {
        Ok(())
    } else {
        Err(ClusterError::PermissionDenied { role, kind })
    }
}
