//! The message bus seam.
//!
//! The coordinator and nodes only ever talk through a [`Transport`]. Sends are
//! fire-and-forget: a successful `send` means the bus accepted the message,
//! not that anyone acted on it. [`LocalBus`] is the in-process implementation
//! used by single-host deployments and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use arcvault_types::{NodeId, ReplicaId, StorageNodeIdentity};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{ClusterError, Message, Result};

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// The coordinator's inbox.
    Coordinator,
    /// Every node subscribed for the replica.
    Replica(ReplicaId),
}

/// An ordered, at-least-once, reply-addressable asynchronous bus.
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn send(&self, to: Destination, message: Message) -> Result<()>;
}

/// In-process bus over unbounded tokio channels.
#[derive(Debug)]
pub struct LocalBus {
    coordinator: UnboundedSender<Message>,
    replicas: RwLock<HashMap<ReplicaId, Vec<(NodeId, UnboundedSender<Message>)>>>,
}

impl LocalBus {
    /// Creates the bus and the coordinator's inbox.
    pub fn new() -> (Self, UnboundedReceiver<Message>) {
        let (coordinator, inbox) = mpsc::unbounded_channel();
        let bus = Self {
            coordinator,
            replicas: RwLock::new(HashMap::new()),
        };
        (bus, inbox)
    }

    /// Subscribes a node to broadcasts for its replica and returns its inbox.
    ///
    /// Subscribing the same node again replaces its previous inbox.
    pub fn subscribe(&self, node: &StorageNodeIdentity) -> Result<UnboundedReceiver<Message>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut replicas = self.replicas.write().map_err(|_| ClusterError::poisoned())?;
        let members = replicas.entry(node.replica_id.clone()).or_default();
        members.retain(|(id, _)| id != &node.node_id);
        members.push((node.node_id.clone(), tx));
        tracing::debug!(node = %node, "node subscribed to bus");
        Ok(rx)
    }

    /// Number of nodes currently subscribed for `replica`.
    pub fn subscriber_count(&self, replica: &ReplicaId) -> Result<usize> {
        let replicas = self.replicas.read().map_err(|_| ClusterError::poisoned())?;
        Ok(replicas.get(replica).map_or(0, Vec::len))
    }
}

impl Transport for LocalBus {
    fn send(&self, to: Destination, message: Message) -> Result<()> {
        match to {
            Destination::Coordinator => self
                .coordinator
                .send(message)
                .map_err(|_| ClusterError::Transport("coordinator inbox is closed".to_string())),
            Destination::Replica(replica) => {
                let kind = message.kind();
                if message.try_clone().is_none() {
                    return Err(ClusterError::InvalidArgument(format!(
                        "{kind} messages cannot be broadcast"
                    )));
                }
                let mut replicas = self.replicas.write().map_err(|_| ClusterError::poisoned())?;
                let Some(members) = replicas.get_mut(&replica) else {
                    tracing::debug!(replica = %replica, %kind, "no subscribers for broadcast");
                    return Ok(());
                };
                members.retain(|(node, tx)| {
                    let delivered = message.try_clone().is_some_and(|copy| tx.send(copy).is_ok());
                    if !delivered {
                        tracing::debug!(node = %node, replica = %replica, "dropping closed subscriber");
                    }
                    delivered
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use arcvault_batch::BatchJobSpec;
    use arcvault_types::RoundId;

    use super::*;
    use crate::{BatchReply, DispatchBatch};

    fn identity(node: &str, replica: &str) -> StorageNodeIdentity {
        StorageNodeIdentity::new(NodeId::new(node).unwrap(), ReplicaId::new(replica).unwrap())
    }

    fn dispatch(replica: &str) -> Message {
        Message::Dispatch(DispatchBatch {
            round: RoundId::generate(),
            replica: ReplicaId::new(replica).unwrap(),
            job: BatchJobSpec::file_list(),
        })
    }

    #[test]
    fn broadcast_reaches_every_node_of_the_replica_only() {
        let (bus, _inbox) = LocalBus::new();
        let mut a1 = bus.subscribe(&identity("a1", "A")).unwrap();
        let mut a2 = bus.subscribe(&identity("a2", "A")).unwrap();
        let mut b1 = bus.subscribe(&identity("b1", "B")).unwrap();

        bus.send(Destination::Replica(ReplicaId::new("A").unwrap()), dispatch("A"))
            .unwrap();

        assert!(matches!(a1.try_recv(), Ok(Message::Dispatch(_))));
        assert!(matches!(a2.try_recv(), Ok(Message::Dispatch(_))));
        assert!(b1.try_recv().is_err());
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let (bus, _inbox) = LocalBus::new();
        let replica = ReplicaId::new("A").unwrap();
        drop(bus.subscribe(&identity("a1", "A")).unwrap());
        let _a2 = bus.subscribe(&identity("a2", "A")).unwrap();

        bus.send(Destination::Replica(replica.clone()), dispatch("A")).unwrap();
        assert_eq!(bus.subscriber_count(&replica).unwrap(), 1);
    }

    #[test]
    fn replies_go_to_the_coordinator_and_cannot_be_broadcast() {
        let (bus, mut inbox) = LocalBus::new();
        let reply = || {
            Message::Reply(BatchReply {
                round: RoundId::generate(),
                node: identity("a1", "A"),
                files_processed: 0,
                files_failed: Vec::new(),
                exceptions: Vec::new(),
                result: None,
            })
        };

        bus.send(Destination::Coordinator, reply()).unwrap();
        assert!(matches!(inbox.try_recv(), Ok(Message::Reply(_))));

        let _a1 = bus.subscribe(&identity("a1", "A")).unwrap();
        assert!(matches!(
            bus.send(Destination::Replica(ReplicaId::new("A").unwrap()), reply()),
            Err(ClusterError::InvalidArgument(_))
        ));
    }
}
