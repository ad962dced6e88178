//! Drives listing rounds against every replica and classifies the results.

use std::future::Future;
use std::sync::Arc;

use arcvault_batch::BatchJobSpec;
use arcvault_cluster::{AggregatedBatchResult, BatchCoordinator, ClusterError, RoundStatus};
use arcvault_types::{Replica, ReplicaId};
use tokio_util::sync::CancellationToken;

use crate::classify::{ReconciliationReport, classify};
use crate::error::{ReconcileError, Result};
use crate::listing::{ChecksumListing, FileListing};

/// Where listings come from.
///
/// The coordinator is the production source; tests supply canned listings.
pub trait ReplicaSource: Send + Sync {
    fn fetch_filenames(
        &self,
        replica: &ReplicaId,
    ) -> impl Future<Output = Result<FileListing>> + Send;

    fn fetch_checksums(
        &self,
        replica: &ReplicaId,
    ) -> impl Future<Output = Result<ChecksumListing>> + Send;
}

/// Runs the built-in listing jobs through a [`BatchCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorSource {
    coordinator: Arc<BatchCoordinator>,
    shutdown: CancellationToken,
}

impl CoordinatorSource {
    pub fn new(coordinator: Arc<BatchCoordinator>, shutdown: CancellationToken) -> Self {
        Self {
            coordinator,
            shutdown,
        }
    }

    async fn run(&self, replica: &ReplicaId, job: BatchJobSpec) -> Result<(bool, String)> {
        let listing_error = |source: ClusterError| ReconcileError::Listing {
            replica: replica.to_string(),
            source,
        };
        let result = self
            .coordinator
            .run_batch(replica, job, None, &self.shutdown)
            .await
            .map_err(listing_error)?;
        let complete = is_complete(&result);
        let bytes = result.read_result().map_err(listing_error)?;
        Ok((complete, String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Only a round every expected node answered cleanly proves absence.
fn is_complete(result: &AggregatedBatchResult) -> bool {
    result.status == RoundStatus::Completed && result.failed_files.is_empty()
}

impl ReplicaSource for CoordinatorSource {
    async fn fetch_filenames(&self, replica: &ReplicaId) -> Result<FileListing> {
        let (complete, output) = self.run(replica, BatchJobSpec::file_list()).await?;
        Ok(FileListing::parse(replica.clone(), complete, &output))
    }

    async fn fetch_checksums(&self, replica: &ReplicaId) -> Result<ChecksumListing> {
        let (complete, output) = self.run(replica, BatchJobSpec::checksum()).await?;
        Ok(ChecksumListing::parse(replica.clone(), complete, &output))
    }
}

/// Compares replicas and proposes repairs. It never mutates a replica.
#[derive(Debug)]
pub struct ReplicaReconciler<S> {
    source: S,
}

impl<S: ReplicaSource> ReplicaReconciler<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Lists every replica, then checksums every replica that reported
    /// files, and classifies the union of filenames.
    pub async fn reconcile(&self, replicas: &[Replica]) -> Result<ReconciliationReport> {
        if replicas.len() < 2 {
            return Err(ReconcileError::InvalidArgument(format!(
                "reconciliation needs at least two replicas, got {}",
                replicas.len()
            )));
        }

        let mut files = Vec::with_capacity(replicas.len());
        for replica in replicas {
            let listing = self.source.fetch_filenames(&replica.id).await?;
            tracing::info!(
                replica = %replica.id,
                files = listing.filenames.len(),
                complete = listing.complete,
                "file listing collected"
            );
            files.push(listing);
        }

        let mut checksums = Vec::with_capacity(replicas.len());
        for listing in files.iter().filter(|l| !l.filenames.is_empty()) {
            let sums = self.source.fetch_checksums(&listing.replica).await?;
            tracing::info!(
                replica = %listing.replica,
                files = sums.checksums.len(),
                malformed = sums.malformed_lines,
                complete = sums.complete,
                "checksum listing collected"
            );
            checksums.push(sums);
        }

        Ok(classify(replicas, &files, &checksums))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use arcvault_batch::JobRegistry;
    use arcvault_cluster::{CoordinatorConfig, LivenessTracker, LocalBus};
    use arcvault_types::{Checksum, ReplicaKind};

    use super::*;
    use crate::{FileClassification, RepairAction};

    #[derive(Default)]
    struct CannedSource {
        files: HashMap<ReplicaId, (bool, &'static str)>,
        checksums: HashMap<ReplicaId, String>,
    }

    impl ReplicaSource for CannedSource {
        async fn fetch_filenames(&self, replica: &ReplicaId) -> Result<FileListing> {
            let (complete, body) = self.files.get(replica).copied().unwrap_or((true, ""));
            Ok(FileListing::parse(replica.clone(), complete, body))
        }

        async fn fetch_checksums(&self, replica: &ReplicaId) -> Result<ChecksumListing> {
            let body = self.checksums.get(replica).cloned().unwrap_or_default();
            Ok(ChecksumListing::parse(replica.clone(), true, &body))
        }
    }

    fn id(name: &str) -> ReplicaId {
        ReplicaId::new(name).unwrap()
    }

    fn replicas() -> Vec<Replica> {
        vec![
            Replica::new(id("BA1"), ReplicaKind::Bitarchive, "one"),
            Replica::new(id("BA2"), ReplicaKind::Bitarchive, "two"),
            Replica::new(id("CS"), ReplicaKind::Checksum, "checksums"),
        ]
    }

    fn line(name: &str, content: &[u8]) -> String {
        format!("{name}##{}\n", Checksum::of_bytes(content))
    }

    #[tokio::test]
    async fn finds_missing_and_changed_files() {
        let mut source = CannedSource::default();
        source.files.insert(id("BA1"), (true, "a.arc\nb.arc\n"));
        source.files.insert(id("BA2"), (true, "a.arc\n"));
        source.files.insert(id("CS"), (true, "a.arc\nb.arc\n"));
        source.checksums.insert(id("BA1"), line("a.arc", b"a") + &line("b.arc", b"b"));
        source.checksums.insert(id("BA2"), line("a.arc", b"tampered"));
        source.checksums.insert(id("CS"), line("a.arc", b"a") + &line("b.arc", b"b"));

        let report = ReplicaReconciler::new(source).reconcile(&replicas()).await.unwrap();

        assert!(!report.is_consistent());
        assert_eq!(report.missing_from(&id("BA2")).collect::<Vec<_>>(), vec!["b.arc"]);
        let changed: Vec<_> = report.mismatched().map(|f| f.filename.as_str()).collect();
        assert_eq!(changed, vec!["a.arc"]);
        assert!(report.plan.actions.contains(&RepairAction::ReUpload {
            filename: "b.arc".to_string(),
            to: id("BA2"),
            from: id("BA1"),
        }));
        assert!(report.plan.actions.contains(&RepairAction::Correct {
            filename: "a.arc".to_string(),
            replica: id("BA2"),
            from: id("BA1"),
            reference: Checksum::of_bytes(b"a"),
        }));
    }

    #[tokio::test]
    async fn rejects_a_single_replica() {
        let result = ReplicaReconciler::new(CannedSource::default())
            .reconcile(&replicas()[..1])
            .await;
        assert!(matches!(result, Err(ReconcileError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn replica_without_live_nodes_yields_incomplete_listing() {
        let (bus, _inbox) = LocalBus::new();
        let coordinator = Arc::new(BatchCoordinator::new(
            Arc::new(bus),
            Arc::new(LivenessTracker::new()),
            JobRegistry::new(),
            CoordinatorConfig {
                acceptable_heartbeat_delay: Duration::from_secs(60),
                default_timeout: Duration::from_secs(5),
                max_node_failures: 0,
                result_dir: std::env::temp_dir(),
            },
        ));
        let source = CoordinatorSource::new(coordinator, CancellationToken::new());

        let listing = source.fetch_filenames(&id("BA1")).await.unwrap();
        assert!(!listing.complete);
        assert!(listing.filenames.is_empty());

        let mut canned = CannedSource::default();
        canned.files.insert(id("BA2"), (true, "a.arc\n"));
        canned.checksums.insert(id("BA2"), line("a.arc", b"a"));
        canned.files.insert(id("BA1"), (false, ""));
        let report = ReplicaReconciler::new(canned).reconcile(&replicas()[..2]).await.unwrap();
        assert!(report.incomplete.contains(&id("BA1")));
        assert_eq!(report.files[0].classification, FileClassification::Consistent);
    }
}
