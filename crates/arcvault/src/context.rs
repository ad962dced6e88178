//! The process context: one journal, one tracker and one coordinator.

use std::path::Path;
use std::sync::Arc;

use arcvault_batch::JobRegistry;
use arcvault_bitarchive::{Bitarchive, BitarchiveOptions};
use arcvault_cluster::{
    BatchCoordinator, BatchTarget, CoordinatorConfig, LivenessTracker, Message, NodeConfig,
    StorageNode, Transport,
};
use arcvault_config::ArchiveConfig;
use arcvault_journal::{
    ChecksumEntry, ChecksumJournal, CorrectionOutcome, JournalError, JournalOptions,
};
use arcvault_reconcile::{CoordinatorSource, ReconciliationReport, ReplicaReconciler};
use arcvault_types::StorageNodeIdentity;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ArchiveError, Result};

/// Owns the long-lived services of an arcvault process.
///
/// Nothing in arcvault is a process-wide singleton. Components receive
/// references to the instances held here.
#[derive(Debug)]
pub struct ArchiveContext {
    config: ArchiveConfig,
    journal: Arc<ChecksumJournal>,
    tracker: Arc<LivenessTracker>,
    coordinator: Arc<BatchCoordinator>,
    registry: JobRegistry,
    shutdown: CancellationToken,
}

impl ArchiveContext {
    /// Validates `config`, opens the journal and wires the coordinator to
    /// `transport`.
    pub fn open(config: ArchiveConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::open_with_registry(config, transport, JobRegistry::new())
    }

    pub fn open_with_registry(
        config: ArchiveConfig,
        transport: Arc<dyn Transport>,
        registry: JobRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let journal = Arc::new(ChecksumJournal::open(
            &config.journal.data_dir,
            JournalOptions {
                min_space_left: config.journal.min_space_left,
                min_space_required_after_write: config.journal.min_space_required_after_write,
            },
        )?);
        let tracker = Arc::new(LivenessTracker::new());
        let coordinator = Arc::new(BatchCoordinator::new(
            transport,
            tracker.clone(),
            registry.clone(),
            CoordinatorConfig {
                acceptable_heartbeat_delay: config.heartbeat.acceptable_delay(),
                default_timeout: config.batch.timeout(),
                max_node_failures: config.batch.max_node_failures,
                result_dir: config.batch.result_dir.clone(),
            },
        ));
        tracing::info!(
            journal = %config.journal.data_dir.display(),
            replicas = config.replicas.len(),
            "archive context opened"
        );

        Ok(Self {
            config,
            journal,
            tracker,
            coordinator,
            registry,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn journal(&self) -> &Arc<ChecksumJournal> {
        &self.journal
    }

    pub fn tracker(&self) -> &Arc<LivenessTracker> {
        &self.tracker
    }

    pub fn coordinator(&self) -> &Arc<BatchCoordinator> {
        &self.coordinator
    }

    /// Cancelled by [`ArchiveContext::shutdown`]; every spawned loop watches it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn shutdown(&self) {
        tracing::info!("archive context shutting down");
        self.shutdown.cancel();
    }

    /// Uploads into the journal, retrying failed writes up to the configured
    /// limit. Rejections such as a conflicting checksum are not retried.
    pub fn upload(&self, source: &Path, filename: &str) -> Result<ChecksumEntry> {
        let limit = self.config.journal.upload_retry_limit;
        let mut attempt = 1;
        loop {
            match self.journal.upload(source, filename) {
                Ok(entry) => return Ok(entry),
                Err(
                    err @ (JournalError::UploadFailed { .. }
                    | JournalError::ChecksumMismatch { .. }),
                ) => {
                    if attempt >= limit {
                        return Err(ArchiveError::UploadExhausted {
                            filename: filename.to_string(),
                            attempts: attempt,
                            last: err,
                        });
                    }
                    tracing::warn!(
                        filename,
                        attempt,
                        limit,
                        error = %err,
                        "upload attempt failed, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn correct(&self, filename: &str, reference: &Path) -> Result<CorrectionOutcome> {
        Ok(self.journal.correct(filename, reference)?)
    }

    /// Opens this process's bitarchive under `node.data_dir`.
    pub fn open_bitarchive(&self) -> Result<Bitarchive> {
        let journal = &self.config.journal;
        Ok(Bitarchive::open(
            &self.config.node.data_dir,
            BitarchiveOptions {
                min_space_left: journal.min_space_left,
                min_space_required_after_write: journal.min_space_required_after_write,
                record_memory_threshold: journal.record_memory_threshold,
            },
        )?)
    }

    /// The configured node identity, when both ids are set.
    pub fn node_identity(&self) -> Option<StorageNodeIdentity> {
        let node = &self.config.node;
        Some(StorageNodeIdentity::new(
            node.node_id.clone()?,
            node.replica_id.clone()?,
        ))
    }

    /// Runs the coordinator's message loop until shutdown.
    pub fn spawn_coordinator(&self, inbox: UnboundedReceiver<Message>) -> JoinHandle<()> {
        tokio::spawn(self.coordinator.clone().run(inbox, self.shutdown.child_token()))
    }

    /// Runs a storage node serving `target` until shutdown.
    pub fn spawn_node<T: BatchTarget>(
        &self,
        identity: StorageNodeIdentity,
        target: Arc<T>,
        transport: Arc<dyn Transport>,
        inbox: UnboundedReceiver<Message>,
    ) -> JoinHandle<()> {
        let node = Arc::new(StorageNode::new(
            identity,
            target,
            self.registry.clone(),
            transport,
            NodeConfig {
                heartbeat_interval: self.config.heartbeat.interval(),
                max_exceptions: self.config.batch.max_exceptions,
            },
        ));
        tokio::spawn(node.run(inbox, self.shutdown.child_token()))
    }

    /// Compares every configured replica.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let source = CoordinatorSource::new(self.coordinator.clone(), self.shutdown.child_token());
        Ok(ReplicaReconciler::new(source)
            .reconcile(&self.config.replicas)
            .await?)
    }
}
