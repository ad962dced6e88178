//! Pure classification of files across replica listings.
//!
//! Detection never touches data: it turns listings into a
//! [`ReconciliationReport`] with a [`RepairPlan`] that callers execute through
//! the coordinator or the journal.

use std::collections::{BTreeMap, BTreeSet};

use arcvault_types::{Checksum, Replica, ReplicaId, ReplicaKind};
use serde::Serialize;

use crate::{ChecksumListing, FileListing};

/// What one replica holds for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReplicaChecksum {
    /// All copies in the replica agree.
    Unique(Checksum),
    /// Copies within the replica disagree with each other.
    Inconsistent(BTreeSet<Checksum>),
}

impl ReplicaChecksum {
    fn unique(&self) -> Option<&Checksum> {
        match self {
            Self::Unique(c) => Some(c),
            Self::Inconsistent(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FileClassification {
    /// Present everywhere it is checked, with one checksum.
    Consistent,
    /// Absent from the listed replicas, with no checksum disagreement.
    MissingFrom(BTreeSet<ReplicaId>),
    /// Replicas disagree on the content. `disagreeing` are the replicas that
    /// differ from the reference, or every holder when there is none.
    ChecksumMismatch { disagreeing: BTreeSet<ReplicaId> },
}

/// The verdict for one filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub filename: String,
    pub classification: FileClassification,
    pub present_in: BTreeSet<ReplicaId>,
    /// Complete-listing replicas that do not have the file.
    pub missing_from: BTreeSet<ReplicaId>,
    pub checksums: BTreeMap<ReplicaId, ReplicaChecksum>,
    /// The checksum a strict majority of holders agree on.
    pub reference: Option<Checksum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RepairAction {
    /// Copy the file from `from` into `to`, where it is missing.
    ReUpload {
        filename: String,
        to: ReplicaId,
        from: ReplicaId,
    },
    /// Replace `replica`'s copy (or checksum entry) with the copy from `from`,
    /// which matches `reference`.
    Correct {
        filename: String,
        replica: ReplicaId,
        from: ReplicaId,
        reference: Checksum,
    },
    /// No authoritative source exists; an operator must decide.
    ManualReview { filename: String, reason: String },
}

/// Proposed repairs. Nothing here has been executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairPlan {
    pub actions: Vec<RepairAction>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn manual_reviews(&self) -> impl Iterator<Item = &RepairAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, RepairAction::ManualReview { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// One entry per filename seen anywhere, sorted by filename.
    pub files: Vec<FileReport>,
    /// Replicas whose listings were incomplete.
    pub incomplete: BTreeSet<ReplicaId>,
    pub plan: RepairPlan,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.files
            .iter()
            .all(|f| f.classification == FileClassification::Consistent)
    }

    /// Files classified as missing from `replica`.
    pub fn missing_from<'a>(&'a self, replica: &'a ReplicaId) -> impl Iterator<Item = &'a str> {
        self.files
            .iter()
            .filter(move |f| f.missing_from.contains(replica))
            .map(|f| f.filename.as_str())
    }

    pub fn mismatched(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| {
            matches!(f.classification, FileClassification::ChecksumMismatch { .. })
        })
    }
}

/// The checksum held by strictly more than half of `holders`, if any.
///
/// Replicas whose copies disagree internally cast no vote but still count
/// as holders.
pub fn majority_checksum(
    holders: usize,
    checksums: &BTreeMap<ReplicaId, ReplicaChecksum>,
) -> Option<Checksum> {
    let mut votes: BTreeMap<&Checksum, usize> = BTreeMap::new();
    for checksum in checksums.values().filter_map(ReplicaChecksum::unique) {
        *votes.entry(checksum).or_default() += 1;
    }
    votes
        .into_iter()
        .find(|(_, count)| count * 2 > holders)
        .map(|(checksum, _)| checksum.clone())
}

/// Classifies every file seen in `files` and plans repairs.
pub fn classify(
    replicas: &[Replica],
    files: &[FileListing],
    checksums: &[ChecksumListing],
) -> ReconciliationReport {
    let kinds: BTreeMap<&ReplicaId, ReplicaKind> =
        replicas.iter().map(|r| (&r.id, r.kind)).collect();
    let incomplete: BTreeSet<ReplicaId> = files
        .iter()
        .filter(|l| !l.complete)
        .map(|l| l.replica.clone())
        .chain(checksums.iter().filter(|l| !l.complete).map(|l| l.replica.clone()))
        .collect();

    let all_names: BTreeSet<&String> = files.iter().flat_map(|l| l.filenames.iter()).collect();
    let mut reports = Vec::with_capacity(all_names.len());
    let mut plan = RepairPlan::default();

    for filename in all_names {
        let present_in: BTreeSet<ReplicaId> = files
            .iter()
            .filter(|l| l.filenames.contains(filename))
            .map(|l| l.replica.clone())
            .collect();
        let missing_from: BTreeSet<ReplicaId> = files
            .iter()
            .filter(|l| l.complete && !l.filenames.contains(filename))
            .map(|l| l.replica.clone())
            .collect();

        let mut per_replica = BTreeMap::new();
        for listing in checksums.iter().filter(|l| present_in.contains(&l.replica)) {
            if let Some(sums) = listing.checksums.get(filename.as_str()) {
                let value = if sums.len() == 1 {
                    sums.iter().next().cloned().map(ReplicaChecksum::Unique)
                } else {
                    Some(ReplicaChecksum::Inconsistent(sums.clone()))
                };
                if let Some(value) = value {
                    per_replica.insert(listing.replica.clone(), value);
                }
            }
        }

        let reference = majority_checksum(present_in.len(), &per_replica);
        let distinct: BTreeSet<&Checksum> = per_replica
            .values()
            .flat_map(|c| match c {
                ReplicaChecksum::Unique(sum) => vec![sum],
                ReplicaChecksum::Inconsistent(sums) => sums.iter().collect(),
            })
            .collect();

        let classification = if distinct.len() > 1 {
            let disagreeing = per_replica
                .iter()
                .filter(|(_, c)| reference.is_none() || c.unique() != reference.as_ref())
                .map(|(r, _)| r.clone())
                .collect();
            FileClassification::ChecksumMismatch { disagreeing }
        } else if !missing_from.is_empty() {
            FileClassification::MissingFrom(missing_from.clone())
        } else {
            FileClassification::Consistent
        };

        let report = FileReport {
            filename: filename.clone(),
            classification,
            present_in,
            missing_from,
            checksums: per_replica,
            reference,
        };
        plan_repairs(&report, &kinds, &mut plan);
        reports.push(report);
    }

    let report = ReconciliationReport {
        files: reports,
        incomplete,
        plan,
    };
    tracing::info!(
        files = report.files.len(),
        mismatched = report.mismatched().count(),
        actions = report.plan.actions.len(),
        incomplete = report.incomplete.len(),
        "classified replica listings"
    );
    report
}

/// A bitarchive holding a copy that matches `reference`, other than `not`.
fn content_source<'a>(
    report: &'a FileReport,
    reference: &Checksum,
    kinds: &BTreeMap<&ReplicaId, ReplicaKind>,
    not: &ReplicaId,
) -> Option<&'a ReplicaId> {
    report
        .checksums
        .iter()
        .filter(|(r, _)| *r != not && kinds.get(r) == Some(&ReplicaKind::Bitarchive))
        .find(|(_, c)| c.unique() == Some(reference))
        .map(|(r, _)| r)
}

fn plan_repairs(
    report: &FileReport,
    kinds: &BTreeMap<&ReplicaId, ReplicaKind>,
    plan: &mut RepairPlan,
) {
    let filename = &report.filename;
    let manual = |reason: String| RepairAction::ManualReview {
        filename: filename.clone(),
        reason,
    };

    if report.classification == FileClassification::Consistent {
        return;
    }
    let Some(reference) = &report.reference else {
        plan.actions.push(manual(
            "no checksum is held by a majority of the replicas holding the file".to_string(),
        ));
        return;
    };

    if let FileClassification::ChecksumMismatch { disagreeing } = &report.classification {
        for replica in disagreeing {
            match content_source(report, reference, kinds, replica) {
                Some(from) => plan.actions.push(RepairAction::Correct {
                    filename: filename.clone(),
                    replica: replica.clone(),
                    from: from.clone(),
                    reference: reference.clone(),
                }),
                None => plan.actions.push(manual(format!(
                    "no bitarchive holds a copy matching the reference for {replica}"
                ))),
            }
        }
    }

    for replica in &report.missing_from {
        match content_source(report, reference, kinds, replica) {
            Some(from) => plan.actions.push(RepairAction::ReUpload {
                filename: filename.clone(),
                to: replica.clone(),
                from: from.clone(),
            }),
            None => plan.actions.push(manual(format!(
                "no bitarchive holds a copy matching the reference to restore {replica}"
            ))),
        }
    }
}
