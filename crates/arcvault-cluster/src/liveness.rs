//! Heartbeat-based liveness tracking.
//!
//! The tracker keeps one last-seen timestamp per node, overwritten on every
//! signal of life. A node is alive at `now` while
//! `now - last_seen <= acceptable_delay`; a node that never signalled is never
//! alive.
//!
//! Known nodes are updated through atomics under a shared lock, so heartbeats
//! from many nodes and liveness queries from many rounds proceed in parallel.
//! The exclusive lock is taken only when a node is seen for the first time or
//! moves to another replica.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arcvault_types::{NodeId, ReplicaId, StorageNodeIdentity, Timestamp};

use crate::{ClusterError, Result};

#[derive(Debug)]
struct NodeLiveness {
    replica: ReplicaId,
    last_seen: AtomicU64,
    /// Set once the node has been reported as dropped out, cleared on the
    /// next signal of life.
    reported_dead: AtomicBool,
}

/// Per-node last-seen map.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    nodes: RwLock<HashMap<NodeId, NodeLiveness>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a signal of life from `node` at `at`. Last write wins.
    pub fn record(&self, node: &StorageNodeIdentity, at: Timestamp) -> Result<()> {
        {
            let nodes = self.nodes.read().map_err(|_| ClusterError::poisoned())?;
            if let Some(entry) = nodes.get(&node.node_id)
                && entry.replica == node.replica_id
            {
                entry.last_seen.store(at.as_millis(), Ordering::Release);
                if entry.reported_dead.swap(false, Ordering::AcqRel) {
                    tracing::info!(node = %node, "node is alive again");
                }
                tracing::trace!(node = %node, at = %at, "sign of life");
                return Ok(());
            }
        }

        let mut nodes = self.nodes.write().map_err(|_| ClusterError::poisoned())?;
        let previous = nodes.insert(
            node.node_id.clone(),
            NodeLiveness {
                replica: node.replica_id.clone(),
                last_seen: AtomicU64::new(at.as_millis()),
                reported_dead: AtomicBool::new(false),
            },
        );
        match previous {
            None => tracing::info!(node = %node, "first heartbeat from node"),
            Some(old) => tracing::warn!(
                node = %node,
                old_replica = %old.replica,
                "node moved to another replica"
            ),
        }
        Ok(())
    }

    /// Nodes of every replica alive at `now`.
    pub fn alive_nodes(&self, now: Timestamp, acceptable_delay: Duration) -> Result<BTreeSet<NodeId>> {
        self.collect_alive(None, now, acceptable_delay)
    }

    /// Nodes of `replica` alive at `now`.
    pub fn alive_nodes_in(
        &self,
        replica: &ReplicaId,
        now: Timestamp,
        acceptable_delay: Duration,
    ) -> Result<BTreeSet<NodeId>> {
        self.collect_alive(Some(replica), now, acceptable_delay)
    }

    /// The last signal of life recorded for `node`.
    pub fn last_seen(&self, node: &NodeId) -> Result<Option<Timestamp>> {
        let nodes = self.nodes.read().map_err(|_| ClusterError::poisoned())?;
        Ok(nodes
            .get(node)
            .map(|e| Timestamp::from_millis(e.last_seen.load(Ordering::Acquire))))
    }

    fn collect_alive(
        &self,
        replica: Option<&ReplicaId>,
        now: Timestamp,
        acceptable_delay: Duration,
    ) -> Result<BTreeSet<NodeId>> {
        let nodes = self.nodes.read().map_err(|_| ClusterError::poisoned())?;
        let mut alive = BTreeSet::new();
        for (id, entry) in nodes.iter() {
            if replica.is_some_and(|r| r != &entry.replica) {
                continue;
            }
            let last = Timestamp::from_millis(entry.last_seen.load(Ordering::Acquire));
            let silence = now.saturating_duration_since(last);
            if silence <= acceptable_delay {
                alive.insert(id.clone());
            } else if !entry.reported_dead.swap(true, Ordering::AcqRel) {
                tracing::warn!(
                    node = %id,
                    replica = %entry.replica,
                    silent_ms = silence.as_millis() as u64,
                    "node missed its heartbeat deadline"
                );
            }
        }
        Ok(alive)
    }
}
