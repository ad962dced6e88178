//! Storage node runtime.
//!
//! A node does three things until shut down: it sends a heartbeat every
//! interval, it runs each dispatched job on a blocking worker against its
//! local store, and it ships the output back to the coordinator as a
//! [`RemoteFile`]. A `TerminateBatch` for a running round stops that run
//! between files.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arcvault_batch::{ExceptionOccurrence, FailurePhase, JobRegistry, LocalRunOutcome, RemoteFile};
use arcvault_types::{RoundId, StorageNodeIdentity, Timestamp};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    BatchReply, BatchTarget, ClusterError, Destination, DispatchBatch, HandlerRole, HeartBeat,
    Message, Result, Transport, check_capability,
};

/// Node tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    pub heartbeat_interval: Duration,
    pub max_exceptions: usize,
}

/// A storage process serving one replica.
pub struct StorageNode<T: BatchTarget> {
    identity: StorageNodeIdentity,
    target: Arc<T>,
    registry: JobRegistry,
    transport: Arc<dyn Transport>,
    config: NodeConfig,
    running: Mutex<HashMap<RoundId, CancellationToken>>,
}

impl<T: BatchTarget> std::fmt::Debug for StorageNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: BatchTarget> StorageNode<T> {
    pub fn new(
        identity: StorageNodeIdentity,
        target: Arc<T>,
        registry: JobRegistry,
        transport: Arc<dyn Transport>,
        config: NodeConfig,
    ) -> Self {
        Self {
            identity,
            target,
            registry,
            transport,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &StorageNodeIdentity {
        &self.identity
    }

    /// Serves `inbox` and sends heartbeats until `shutdown` fires or the bus closes.
    pub async fn run(self: Arc<Self>, mut inbox: UnboundedReceiver<Message>, shutdown: CancellationToken) {
        let mut tick = interval(self.config.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(node = %self.identity, "storage node started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = tick.tick() => self.send_heartbeat(),
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = self.handle(message, &shutdown) {
                        tracing::warn!(node = %self.identity, error = %e, "could not handle message");
                    }
                }
            }
        }

        if let Ok(running) = self.running.lock() {
            for token in running.values() {
                token.cancel();
            }
        }
        tracing::info!(node = %self.identity, "storage node stopped");
    }

    /// Accepts one message addressed to this node.
    pub fn handle(self: &Arc<Self>, message: Message, shutdown: &CancellationToken) -> Result<()> {
        check_capability(HandlerRole::StorageNode, &message)?;
        match message {
            Message::Dispatch(dispatch) => self.start_job(dispatch, shutdown),
            Message::TerminateBatch(terminate) => {
                let running = self.running.lock().map_err(|_| ClusterError::poisoned())?;
                if let Some(token) = running.get(&terminate.round) {
                    tracing::info!(node = %self.identity, round = %terminate.round, "terminating batch job");
                    token.cancel();
                }
                Ok(())
            }
            Message::Reply(_) | Message::HeartBeat(_) => Ok(()),
        }
    }

    fn send_heartbeat(&self) {
        let heartbeat = Message::HeartBeat(HeartBeat {
            node: self.identity.clone(),
            timestamp: Timestamp::now(),
        });
        if let Err(e) = self.transport.send(Destination::Coordinator, heartbeat) {
            tracing::warn!(node = %self.identity, error = %e, "could not send heartbeat");
        }
    }

    fn start_job(self: &Arc<Self>, dispatch: DispatchBatch, shutdown: &CancellationToken) -> Result<()> {
        let round = dispatch.round;
        let token = shutdown.child_token();
        {
            let mut running = self.running.lock().map_err(|_| ClusterError::poisoned())?;
            if running.contains_key(&round) {
                tracing::debug!(node = %self.identity, round = %round, "duplicate dispatch ignored");
                return Ok(());
            }
            running.insert(round, token.clone());
        }
        tracing::info!(node = %self.identity, round = %round, job = ?dispatch.job.kind, "starting batch job");

        let node = Arc::clone(self);
        tokio::spawn(async move {
            let worker = Arc::clone(&node);
            let job_token = token.clone();
            let executed = tokio::task::spawn_blocking(move || worker.execute(&dispatch, &job_token)).await;
            let (outcome, result) = match executed {
                Ok(Ok(done)) => done,
                Ok(Err(e)) => (failed_run(&e.to_string()), None),
                Err(e) => (failed_run(&format!("batch worker panicked: {e}")), None),
            };
            if let Ok(mut running) = node.running.lock() {
                running.remove(&round);
            }

            let reply = BatchReply {
                round,
                node: node.identity.clone(),
                files_processed: outcome.files_processed,
                files_failed: outcome.files_failed,
                exceptions: outcome.exceptions,
                result,
            };
            tracing::info!(
                node = %node.identity,
                round = %round,
                files_processed = reply.files_processed,
                files_failed = reply.files_failed.len(),
                "batch job finished"
            );
            if let Err(e) = node.transport.send(Destination::Coordinator, Message::Reply(reply)) {
                tracing::warn!(node = %node.identity, round = %round, error = %e, "could not send batch reply");
            }
        });
        Ok(())
    }

    /// Runs the job on the calling (blocking) thread.
    fn execute(
        &self,
        dispatch: &DispatchBatch,
        terminate: &CancellationToken,
    ) -> Result<(LocalRunOutcome, Option<RemoteFile>)> {
        let staging = self.target.staging_dir();
        fs::create_dir_all(&staging)?;
        let mut output = tempfile::Builder::new()
            .prefix(&format!("batch-{}-", dispatch.round))
            .tempfile_in(&staging)?;

        let outcome = self.target.execute(
            &dispatch.job,
            &self.registry,
            output.as_file_mut(),
            self.config.max_exceptions,
            terminate,
        )?;

        let path = output.into_temp_path().keep().map_err(|e| ClusterError::Io(e.error))?;
        let result = RemoteFile::adopt(format!("{}-{}", self.identity.node_id, dispatch.round), path)?;
        Ok((outcome, Some(result)))
    }
}

fn failed_run(cause: &str) -> LocalRunOutcome {
    LocalRunOutcome {
        exceptions: vec![ExceptionOccurrence {
            phase: FailurePhase::Initialize,
            filename: None,
            cause: cause.to_string(),
        }],
        ..LocalRunOutcome::default()
    }
}
