//! Fan-out/aggregate execution of batch jobs over a replica.
//!
//! A round goes through these steps:
//!
//! ```text
//! snapshot alive nodes ──▶ register round ──▶ broadcast Dispatch
//!                                               │
//!           ┌───────────────────────────────────┘
//!           ▼
//! wait for: every expected reply │ deadline │ terminate │ shutdown
//!           │
//!           ▼
//! merge partial results ──▶ post-process ──▶ AggregatedBatchResult
//! ```
//!
//! The expected set is fixed at dispatch. Replies are routed to their round by
//! [`BatchCoordinator::handle`]; the round's bookkeeping is dropped when
//! `run_batch` returns or its future is dropped, and any reply arriving
//! after that has its result file released.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arcvault_batch::{BatchJobSpec, JobRegistry, RemoteFile};
use arcvault_types::{NodeId, ReplicaId, RoundId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::{
    BatchReply, ClusterError, Destination, DispatchBatch, HandlerRole, LivenessTracker, Message,
    Result, TerminateBatch, Transport, check_capability,
};

/// Coordinator tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How long a node may stay silent and still be expected to reply.
    pub acceptable_heartbeat_delay: Duration,
    /// Round timeout when neither the caller nor the job sets one.
    pub default_timeout: Duration,
    /// Failing or silent nodes a round tolerates before it is reported failed.
    pub max_node_failures: usize,
    /// Where merged results are written.
    pub result_dir: PathBuf,
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Every expected node replied without failures.
    Completed,
    /// Some nodes failed or stayed silent, within the tolerated maximum.
    PartialFailure,
    /// More nodes failed or stayed silent than tolerated.
    Failed,
    /// No node of the replica was alive at dispatch.
    NoLiveNodes,
    /// Stopped early by an operator.
    Terminated,
}

/// A failure attributed to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub node: NodeId,
    /// `None` for failures not tied to a file (setup, teardown, result transfer).
    pub filename: Option<String>,
    pub cause: String,
}

/// The merged outcome of a round.
#[derive(Debug)]
pub struct AggregatedBatchResult {
    pub round: RoundId,
    pub replica: ReplicaId,
    pub status: RoundStatus,
    pub expected: BTreeSet<NodeId>,
    pub responded: BTreeSet<NodeId>,
    pub non_responding: BTreeSet<NodeId>,
    /// Nodes that replied without being expected. Their data is merged.
    pub unexpected: BTreeSet<NodeId>,
    pub files_processed: usize,
    pub failed_files: Vec<FailedFile>,
    /// The merged (and post-processed) output of every reply.
    pub result: Option<RemoteFile>,
}

impl AggregatedBatchResult {
    fn empty(round: RoundId, replica: ReplicaId, status: RoundStatus) -> Self {
        Self {
            round,
            replica,
            status,
            expected: BTreeSet::new(),
            responded: BTreeSet::new(),
            non_responding: BTreeSet::new(),
            unexpected: BTreeSet::new(),
            files_processed: 0,
            failed_files: Vec::new(),
            result: None,
        }
    }

    /// Completed or within the tolerated failures.
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            RoundStatus::Completed | RoundStatus::PartialFailure | RoundStatus::NoLiveNodes
        )
    }

    /// Reads the merged output. The result can be read once.
    pub fn read_result(&self) -> Result<Vec<u8>> {
        match &self.result {
            Some(file) => Ok(file.read_all()?),
            None => Ok(Vec::new()),
        }
    }
}

enum RoundEvent {
    Reply(BatchReply),
    Terminate,
}

struct RoundSlot {
    replica: ReplicaId,
    events: UnboundedSender<RoundEvent>,
}

/// Removes a round from the routing table when its wait ends, however it ends.
struct RoundGuard<'a> {
    rounds: &'a Mutex<HashMap<RoundId, RoundSlot>>,
    round: RoundId,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        match self.rounds.lock() {
            Ok(mut rounds) => {
                rounds.remove(&self.round);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.round);
            }
        }
        tracing::debug!(round = %self.round, "round unregistered");
    }
}

/// Per-reply bookkeeping while a round is open.
#[derive(Default)]
struct Collected {
    responded: BTreeSet<NodeId>,
    unexpected: BTreeSet<NodeId>,
    failing: BTreeSet<NodeId>,
    files_processed: usize,
    failed_files: Vec<FailedFile>,
}

/// Dispatches batch jobs to replicas and merges the replies.
#[derive(Debug)]
pub struct BatchCoordinator {
    transport: Arc<dyn Transport>,
    tracker: Arc<LivenessTracker>,
    registry: JobRegistry,
    config: CoordinatorConfig,
    rounds: Mutex<HashMap<RoundId, RoundSlot>>,
}

impl std::fmt::Debug for RoundSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundSlot").field("replica", &self.replica).finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        tracker: Arc<LivenessTracker>,
        registry: JobRegistry,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            transport,
            tracker,
            registry,
            config,
            rounds: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<LivenessTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of rounds currently waiting for replies.
    pub fn active_rounds(&self) -> usize {
        self.rounds.lock().map_or(0, |r| r.len())
    }

    /// Runs `job` on every live node of `replica` and merges the replies.
    ///
    /// The wait is bounded by `timeout`, else the job's own timeout, else the
    /// configured default. Nodes that have not replied by then are reported
    /// as non-responding. Cancelling `shutdown` abandons the wait with
    /// [`ClusterError::ShutDown`].
    pub async fn run_batch(
        &self,
        replica: &ReplicaId,
        job: BatchJobSpec,
        timeout: Option<Duration>,
        shutdown: &CancellationToken,
    ) -> Result<AggregatedBatchResult> {
        let timeout = timeout.unwrap_or_else(|| job.timeout_or(self.config.default_timeout));
        let round = RoundId::generate();
        let expected = self.tracker.alive_nodes_in(
            replica,
            Timestamp::now(),
            self.config.acceptable_heartbeat_delay,
        )?;

        if expected.is_empty() {
            tracing::warn!(round = %round, replica = %replica, "no live nodes, batch not dispatched");
            return Ok(AggregatedBatchResult::empty(
                round,
                replica.clone(),
                RoundStatus::NoLiveNodes,
            ));
        }

        std::fs::create_dir_all(&self.config.result_dir)?;
        let mut merged = tempfile::Builder::new()
            .prefix(&format!("round-{round}-"))
            .tempfile_in(&self.config.result_dir)?;

        let (events, mut inbox) = mpsc::unbounded_channel();
        self.rounds.lock().map_err(|_| ClusterError::poisoned())?.insert(
            round,
            RoundSlot {
                replica: replica.clone(),
                events,
            },
        );
        let guard = RoundGuard {
            rounds: &self.rounds,
            round,
        };
        tracing::info!(
            round = %round,
            replica = %replica,
            expected = expected.len(),
            timeout_ms = timeout.as_millis() as u64,
            "dispatching batch round"
        );

        self.transport.send(
            Destination::Replica(replica.clone()),
            Message::Dispatch(DispatchBatch {
                round,
                replica: replica.clone(),
                job: job.clone(),
            }),
        )?;

        let deadline = Instant::now() + timeout;
        let mut pending = expected.clone();
        let mut collected = Collected::default();
        let mut terminated = false;

        while !pending.is_empty() {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!(round = %round, "abandoning round on shutdown");
                    return Err(ClusterError::ShutDown);
                }
                event = inbox.recv() => match event {
                    Some(RoundEvent::Reply(reply)) => {
                        self.collect(round, &expected, &mut pending, &mut collected, reply, merged.as_file_mut());
                    }
                    Some(RoundEvent::Terminate) => {
                        tracing::info!(round = %round, "round terminated by operator");
                        terminated = true;
                        break;
                    }
                    None => break,
                },
                () = sleep_until(deadline) => {
                    let missing: Vec<&str> = pending.iter().map(NodeId::as_str).collect();
                    tracing::warn!(round = %round, missing = ?missing, "batch round timed out");
                    break;
                }
            }
        }
        drop(guard);
        drain_late(&mut inbox);

        merged.as_file_mut().flush()?;
        let merged = merged.into_temp_path();
        let result_path = self.post_process(&job, merged.to_path_buf()).await;
        let merged = merged.keep().map_err(|e| ClusterError::Io(e.error))?;
        let result = match result_path {
            Some(processed) => {
                std::fs::remove_file(&merged)?;
                RemoteFile::adopt(format!("round-{round}"), processed)?
            }
            None => RemoteFile::adopt(format!("round-{round}"), merged)?,
        };

        let non_responding = pending;
        let failing = collected.failing.len() + non_responding.len();
        let status = if terminated {
            RoundStatus::Terminated
        } else if failing > self.config.max_node_failures {
            RoundStatus::Failed
        } else if failing > 0 {
            RoundStatus::PartialFailure
        } else {
            RoundStatus::Completed
        };

        tracing::info!(
            round = %round,
            replica = %replica,
            status = ?status,
            responded = collected.responded.len(),
            non_responding = non_responding.len(),
            files_processed = collected.files_processed,
            files_failed = collected.failed_files.len(),
            "batch round finished"
        );

        Ok(AggregatedBatchResult {
            round,
            replica: replica.clone(),
            status,
            expected,
            responded: collected.responded,
            non_responding,
            unexpected: collected.unexpected,
            files_processed: collected.files_processed,
            failed_files: collected.failed_files,
            result: Some(result),
        })
    }

    /// Accepts one message from the bus.
    ///
    /// Heartbeats and replies refresh the sender's liveness. Replies are routed
    /// to their round; a reply for a round that is not running is discarded
    /// and its result file released.
    pub fn handle(&self, message: Message) -> Result<()> {
        check_capability(HandlerRole::Coordinator, &message)?;
        match message {
            Message::HeartBeat(heartbeat) => self.tracker.record(&heartbeat.node, heartbeat.timestamp),
            Message::Reply(reply) => {
                self.tracker.record(&reply.node, Timestamp::now())?;
                let rounds = self.rounds.lock().map_err(|_| ClusterError::poisoned())?;
                let Some(slot) = rounds.get(&reply.round) else {
                    drop(rounds);
                    discard(reply, "reply for unknown or finished round");
                    return Ok(());
                };
                if let Err(returned) = slot.events.send(RoundEvent::Reply(reply)) {
                    drop(rounds);
                    if let RoundEvent::Reply(reply) = returned.0 {
                        discard(reply, "reply arrived as round closed");
                    }
                }
                Ok(())
            }
            Message::Dispatch(_) | Message::TerminateBatch(_) => Ok(()),
        }
    }

    /// Stops a running round early and tells its nodes to stop.
    ///
    /// Returns `false` if the round is not running.
    pub fn terminate(&self, round: RoundId) -> Result<bool> {
        let replica = {
            let rounds = self.rounds.lock().map_err(|_| ClusterError::poisoned())?;
            let Some(slot) = rounds.get(&round) else {
                return Ok(false);
            };
            if slot.events.send(RoundEvent::Terminate).is_err() {
                return Ok(false);
            }
            slot.replica.clone()
        };
        self.transport.send(
            Destination::Replica(replica.clone()),
            Message::TerminateBatch(TerminateBatch { round, replica }),
        )?;
        Ok(true)
    }

    /// Consumes the coordinator inbox until `shutdown` fires or the bus closes.
    pub async fn run(self: Arc<Self>, mut inbox: UnboundedReceiver<Message>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    let kind = message.kind();
                    if let Err(e) = self.handle(message) {
                        tracing::warn!(%kind, error = %e, "could not handle message");
                    }
                }
            }
        }
        tracing::debug!("coordinator inbox closed");
    }

    fn collect(
        &self,
        round: RoundId,
        expected: &BTreeSet<NodeId>,
        pending: &mut BTreeSet<NodeId>,
        collected: &mut Collected,
        reply: BatchReply,
        merged: &mut File,
    ) {
        let node = reply.node.node_id.clone();
        if collected.responded.contains(&node) || collected.unexpected.contains(&node) {
            discard(reply, "duplicate reply");
            return;
        }
        let is_expected = expected.contains(&node);
        if is_expected {
            pending.remove(&node);
            collected.responded.insert(node.clone());
        } else {
            tracing::warn!(round = %round, node = %node, "reply from node outside the expected set, merging it");
            collected.unexpected.insert(node.clone());
        }
        tracing::debug!(
            round = %round,
            node = %node,
            files_processed = reply.files_processed,
            files_failed = reply.files_failed.len(),
            "batch reply"
        );

        collected.files_processed += reply.files_processed;
        // Unexpected responders contribute data and attributions, never round failures.
        if is_expected && reply.has_failures() {
            collected.failing.insert(node.clone());
        }

        let mut causes: BTreeMap<&str, &str> = BTreeMap::new();
        for occurrence in &reply.exceptions {
            match &occurrence.filename {
                Some(filename) => {
                    causes.entry(filename.as_str()).or_insert(occurrence.cause.as_str());
                }
                None => collected.failed_files.push(FailedFile {
                    node: node.clone(),
                    filename: None,
                    cause: occurrence.cause.clone(),
                }),
            }
        }
        for filename in &reply.files_failed {
            collected.failed_files.push(FailedFile {
                node: node.clone(),
                filename: Some(filename.clone()),
                cause: causes
                    .get(filename.as_str())
                    .map_or("processing failed", |c| *c)
                    .to_string(),
            });
        }

        if let Some(partial) = &reply.result
            && let Err(e) = merge_partial(partial, merged)
        {
            tracing::warn!(round = %round, node = %node, error = %e, "could not merge partial result");
            if is_expected {
                collected.failing.insert(node.clone());
            }
            collected.failed_files.push(FailedFile {
                node,
                filename: None,
                cause: format!("result transfer failed: {e}"),
            });
        }
    }

    /// Runs the job's merge step over `merged`. Returns the processed file, or
    /// `None` to keep the raw concatenation.
    async fn post_process(&self, job: &BatchJobSpec, merged: PathBuf) -> Option<PathBuf> {
        let instance = match self.registry.instantiate(&job.kind) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(error = %e, "job not known to coordinator, skipping post-processing");
                return None;
            }
        };
        let result_dir = self.config.result_dir.clone();

        let task = tokio::task::spawn_blocking(move || -> std::io::Result<Option<PathBuf>> {
            let mut input = BufReader::new(File::open(&merged)?);
            let mut output = tempfile::Builder::new()
                .prefix("processed-")
                .tempfile_in(&result_dir)?;
            if instance.post_process(&mut input, output.as_file_mut())? {
                output.as_file_mut().flush()?;
                let path = output.into_temp_path().keep().map_err(|e| e.error)?;
                Ok(Some(path))
            } else {
                Ok(None)
            }
        });

        match task.await {
            Ok(Ok(processed)) => processed,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "post-processing failed, keeping merged output");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "post-processing task panicked, keeping merged output");
                None
            }
        }
    }
}

/// Appends `partial` to `merged`. A copy that fails partway is cut back so
/// no truncated line reaches the aggregate.
fn merge_partial(partial: &RemoteFile, merged: &mut File) -> Result<u64> {
    let before = merged.stream_position()?;
    match partial.append_to(merged) {
        Ok(copied) => Ok(copied),
        Err(e) => {
            if let Err(undo) = merged
                .set_len(before)
                .and_then(|()| merged.seek(SeekFrom::Start(before)).map(|_| ()))
            {
                tracing::warn!(error = %undo, "could not roll back partial merge");
            }
            Err(e.into())
        }
    }
}

fn discard(reply: BatchReply, reason: &str) {
    tracing::debug!(round = %reply.round, node = %reply.node, reason, "discarding reply");
    if let Some(result) = &reply.result {
        result.cleanup();
    }
}

fn drain_late(inbox: &mut UnboundedReceiver<RoundEvent>) {
    inbox.close();
    while let Ok(event) = inbox.try_recv() {
        if let RoundEvent::Reply(reply) = event {
            discard(reply, "reply arrived after round ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arcvault_types::StorageNodeIdentity;

    use super::*;
    use crate::LocalBus;

    struct Harness {
        coordinator: Arc<BatchCoordinator>,
        bus: Arc<LocalBus>,
        shutdown: CancellationToken,
        _results: tempfile::TempDir,
        staging: tempfile::TempDir,
    }

    fn replica() -> ReplicaId {
        ReplicaId::new("A").unwrap()
    }

    fn identity(node: &str) -> StorageNodeIdentity {
        StorageNodeIdentity::new(NodeId::new(node).unwrap(), replica())
    }

    fn harness(max_node_failures: usize) -> Harness {
        let (bus, inbox) = LocalBus::new();
        let bus = Arc::new(bus);
        let results = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(BatchCoordinator::new(
            bus.clone(),
            Arc::new(LivenessTracker::new()),
            JobRegistry::new(),
            CoordinatorConfig {
                acceptable_heartbeat_delay: Duration::from_secs(60),
                default_timeout: Duration::from_secs(5),
                max_node_failures,
                result_dir: results.path().to_path_buf(),
            },
        ));
        let shutdown = CancellationToken::new();
        tokio::spawn(coordinator.clone().run(inbox, shutdown.clone()));
        Harness {
            coordinator,
            bus,
            shutdown,
            _results: results,
            staging: tempfile::tempdir().unwrap(),
        }
    }

    /// A fake node that answers each dispatch with `lines` and `failed`.
    fn responder(h: &Harness, node: &str, lines: &'static str, failed: &'static [&'static str]) {
        let me = identity(node);
        h.coordinator.tracker().record(&me, Timestamp::now()).unwrap();
        let mut inbox = h.bus.subscribe(&me).unwrap();
        let bus = h.bus.clone();
        let staging = h.staging.path().to_path_buf();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if let Message::Dispatch(dispatch) = message {
                    let result = RemoteFile::stage(&staging, "part", &mut lines.as_bytes()).unwrap();
                    let reply = BatchReply {
                        round: dispatch.round,
                        node: me.clone(),
                        files_processed: lines.lines().count() + failed.len(),
                        files_failed: failed.iter().map(|f| (*f).to_string()).collect(),
                        exceptions: Vec::new(),
                        result: Some(result),
                    };
                    bus.send(Destination::Coordinator, Message::Reply(reply)).unwrap();
                }
            }
        });
    }

    /// A live node that never answers.
    fn silent(h: &Harness, node: &str) -> UnboundedReceiver<Message> {
        let me = identity(node);
        h.coordinator.tracker().record(&me, Timestamp::now()).unwrap();
        h.bus.subscribe(&me).unwrap()
    }

    /// Sends a reply for `round` from `node` through the bus, as a node would.
    fn reply_from(h: &Harness, round: RoundId, node: &str, lines: &str, failed: &[&str]) {
        let result = RemoteFile::stage(h.staging.path(), "part", &mut lines.as_bytes()).unwrap();
        let reply = BatchReply {
            round,
            node: identity(node),
            files_processed: lines.lines().count() + failed.len(),
            files_failed: failed.iter().map(|f| (*f).to_string()).collect(),
            exceptions: Vec::new(),
            result: Some(result),
        };
        h.bus.send(Destination::Coordinator, Message::Reply(reply)).unwrap();
    }

    async fn dispatched_round(inbox: &mut UnboundedReceiver<Message>) -> RoundId {
        match inbox.recv().await {
            Some(Message::Dispatch(dispatch)) => dispatch.round,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_nodes_reply() {
        let h = harness(0);
        responder(&h, "a", "a.arc\n", &[]);
        responder(&h, "b", "b.arc\n", &[]);

        let result = h
            .coordinator
            .run_batch(&replica(), BatchJobSpec::file_list(), None, &h.shutdown)
            .await
            .unwrap();

        assert_eq!(result.status, RoundStatus::Completed);
        assert_eq!(result.files_processed, 2);
        assert!(result.non_responding.is_empty());
        assert_eq!(String::from_utf8(result.read_result().unwrap()).unwrap(), "a.arc\nb.arc\n");
        assert_eq!(h.coordinator.active_rounds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_missing_node_within_tolerance() {
        let h = harness(1);
        responder(&h, "a", "a.arc\n", &[]);
        responder(&h, "b", "b.arc\n", &[]);
        let _c = silent(&h, "c");

        let result = h
            .coordinator
            .run_batch(&replica(), BatchJobSpec::file_list(), None, &h.shutdown)
            .await
            .unwrap();

        assert_eq!(result.status, RoundStatus::PartialFailure);
        assert!(result.is_success());
        assert_eq!(result.non_responding, BTreeSet::from([NodeId::new("c").unwrap()]));
        assert_eq!(result.responded.len(), 2);
        assert_eq!(String::from_utf8(result.read_result().unwrap()).unwrap(), "a.arc\nb.arc\n");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_tolerance_fails_round() {
        let h = harness(0);
        responder(&h, "a", "a.arc\n", &[]);
        responder(&h, "b", "b.arc\n", &[]);
        let _c = silent(&h, "c");

        let result = h
            .coordinator
            .run_batch(&replica(), BatchJobSpec::file_list(), None, &h.shutdown)
            .await
            .unwrap();

        assert_eq!(result.status, RoundStatus::Failed);
        assert!(!result.is_success());
        assert!(result.non_responding.contains(&NodeId::new("c").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_files_are_attributed_to_their_node() {
        let h = harness(1);
        responder(&h, "a", "a.arc\n", &["bad.arc"]);
        responder(&h, "b", "b.arc\n", &[]);

        let result = h
            .coordinator
            .run_batch(&replica(), BatchJobSpec::file_list(), None, &h.shutdown)
            .await
            .unwrap();

        assert_eq!(result.status, RoundStatus::PartialFailure);
        assert_eq!(
            result.failed_files,
            vec![FailedFile {
                node: NodeId::new("a").unwrap(),
                filename: Some("bad.arc".to_string()),
                cause: "processing failed".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_live_nodes_is_an_empty_result() {
        let h = harness(0);
        let result = h
            .coordinator
            .run_batch(&replica(), BatchJobSpec::file_list(), None, &h.shutdown)
            .await
            .unwrap();

        assert_eq!(result.status, RoundStatus::NoLiveNodes);
        assert!(result.expected.is_empty());
        assert!(result.read_result().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_node_is_not_expected() {
        let h = harness(0);
        responder(&h, "a", "a.arc\n", &[]);
        let stale = identity("old");
        h.coordinator
            .tracker()
            .record(&stale, Timestamp::from_millis(1))
            .unwrap();

        let result = h
            .coordinator
            .run_batch(&replica(), BatchJobSpec::file_list(), None, &h.shutdown)
            .await
            .unwrap();

        assert_eq!(result.status, RoundStatus::Completed);
        assert!(!result.expected.contains(&stale.node_id));
    }

    #[tokio::test(start_paused = true)]
    async fn post_process_sorts_checksum_output() {
        let h = harness(0);
        responder(&h, "a", "z.arc##00\nb.arc##11\n", &[]);
        responder(&h, "b", "b.arc##11\n", &[]);

        let result = h
            .coordinator
            .run_batch(&replica(), BatchJobSpec::checksum(), None, &h.shutdown)
            .await
            .unwrap();

        assert_eq!(
            String::from_utf8(result.read_result().unwrap()).unwrap(),
            "b.arc##11\nz.arc##00\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_round_without_leaking() {
        let h = harness(0);
        let _a = silent(&h, "a");
        let shutdown = CancellationToken::new();

        let coordinator = h.coordinator.clone();
        let stop = shutdown.clone();
        let round = tokio::spawn(async move {
            coordinator
                .run_batch(&replica(), BatchJobSpec::file_list(), None, &stop)
                .await
        });
        tokio::task::yield_now().await;
        shutdown.cancel();

        assert!(matches!(round.await.unwrap(), Err(ClusterError::ShutDown)));
        assert_eq!(h.coordinator.active_rounds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_ends_round_and_notifies_nodes() {
        let h = harness(0);
        let mut a = silent(&h, "a");

        let coordinator = h.coordinator.clone();
        let shutdown = h.shutdown.clone();
        let round = tokio::spawn(async move {
            coordinator
                .run_batch(&replica(), BatchJobSpec::file_list(), None, &shutdown)
                .await
        });

        let Some(Message::Dispatch(dispatch)) = a.recv().await else {
            panic!("expected dispatch");
        };
        assert!(h.coordinator.terminate(dispatch.round).unwrap());
        assert!(matches!(a.recv().await, Some(Message::TerminateBatch(t)) if t.round == dispatch.round));

        let result = round.await.unwrap().unwrap();
        assert_eq!(result.status, RoundStatus::Terminated);
        assert!(!h.coordinator.terminate(dispatch.round).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_released() {
        let h = harness(1);
        let mut a = silent(&h, "a");

        let result = h
            .coordinator
            .run_batch(&replica(), BatchJobSpec::file_list(), None, &h.shutdown)
            .await
            .unwrap();
        assert_eq!(result.status, RoundStatus::PartialFailure);

        let Some(Message::Dispatch(dispatch)) = a.recv().await else {
            panic!("expected dispatch");
        };
        let late = RemoteFile::stage(h.staging.path(), "late", &mut &b"late\n"[..]).unwrap();
        let reply = BatchReply {
            round: dispatch.round,
            node: identity("a"),
            files_processed: 1,
            files_failed: Vec::new(),
            exceptions: Vec::new(),
            result: Some(late),
        };
        h.coordinator.handle(Message::Reply(reply)).unwrap();

        assert_eq!(std::fs::read_dir(h.staging.path()).unwrap().count(), 0);
        assert_eq!(h.coordinator.active_rounds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_rejects_dispatch_messages() {
        let h = harness(0);
        let dispatch = Message::Dispatch(DispatchBatch {
            round: RoundId::generate(),
            replica: replica(),
            job: BatchJobSpec::file_list(),
        });
        assert!(matches!(
            h.coordinator.handle(dispatch),
            Err(ClusterError::PermissionDenied { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_unexpected_responder_does_not_fail_round() {
        let h = harness(0);
        let mut a = silent(&h, "a");

        let coordinator = h.coordinator.clone();
        let shutdown = h.shutdown.clone();
        let round = tokio::spawn(async move {
            coordinator
                .run_batch(&replica(), BatchJobSpec::file_list(), None, &shutdown)
                .await
        });
        let id = dispatched_round(&mut a).await;

        // "late" was not alive at dispatch; its reply is merged but not judged.
        reply_from(&h, id, "late", "late.arc\n", &["x.arc"]);
        reply_from(&h, id, "a", "a.arc\n", &[]);

        let result = round.await.unwrap().unwrap();
        assert_eq!(result.status, RoundStatus::Completed);
        assert_eq!(result.expected, BTreeSet::from([NodeId::new("a").unwrap()]));
        assert_eq!(result.unexpected, BTreeSet::from([NodeId::new("late").unwrap()]));
        assert_eq!(
            result.failed_files,
            vec![FailedFile {
                node: NodeId::new("late").unwrap(),
                filename: Some("x.arc".to_string()),
                cause: "processing failed".to_string(),
            }]
        );
        assert_eq!(
            String::from_utf8(result.read_result().unwrap()).unwrap(),
            "a.arc\nlate.arc\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_replies_are_discarded_and_expected_set_is_fixed() {
        let h = harness(0);
        let mut a = silent(&h, "a");
        let mut b = silent(&h, "b");

        let coordinator = h.coordinator.clone();
        let shutdown = h.shutdown.clone();
        let round = tokio::spawn(async move {
            coordinator
                .run_batch(&replica(), BatchJobSpec::file_list(), None, &shutdown)
                .await
        });
        let id = dispatched_round(&mut a).await;
        assert_eq!(dispatched_round(&mut b).await, id);

        // A node coming alive mid-round is not added to the round.
        h.coordinator.tracker().record(&identity("c"), Timestamp::now()).unwrap();
        reply_from(&h, id, "a", "a.arc\n", &[]);
        reply_from(&h, id, "a", "dup.arc\n", &[]);
        reply_from(&h, id, "b", "b.arc\n", &[]);

        let result = round.await.unwrap().unwrap();
        assert_eq!(result.status, RoundStatus::Completed);
        assert_eq!(result.files_processed, 2);
        assert!(!result.expected.contains(&NodeId::new("c").unwrap()));
        assert_eq!(result.responded, result.expected);
        assert!(result.unexpected.is_empty());
        assert_eq!(
            String::from_utf8(result.read_result().unwrap()).unwrap(),
            "a.arc\nb.arc\n"
        );
        assert_eq!(std::fs::read_dir(h.staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_merge_leaves_aggregate_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut merged = tempfile::tempfile_in(dir.path()).unwrap();
        merged.write_all(b"a.arc\n").unwrap();

        let consumed = RemoteFile::stage(dir.path(), "gone", &mut &b"b.ar"[..]).unwrap();
        consumed.read_all().unwrap();
        assert!(merge_partial(&consumed, &mut merged).is_err());

        let next = RemoteFile::stage(dir.path(), "next", &mut &b"c.arc\n"[..]).unwrap();
        merge_partial(&next, &mut merged).unwrap();

        let mut content = String::new();
        merged.seek(SeekFrom::Start(0)).unwrap();
        std::io::Read::read_to_string(&mut merged, &mut content).unwrap();
        assert_eq!(content, "a.arc\nc.arc\n");
    }
}
