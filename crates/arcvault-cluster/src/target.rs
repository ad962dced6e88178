//! What a storage node runs batch jobs against.

use std::io::Write;
use std::path::PathBuf;

use arcvault_batch::{
    BatchJobSpec, ExceptionOccurrence, FailurePhase, JobKind, JobRegistry, LocalRunOutcome,
};
use arcvault_bitarchive::Bitarchive;
use arcvault_journal::ChecksumJournal;
use arcvault_types::FILENAME_CHECKSUM_SEPARATOR;
use tokio_util::sync::CancellationToken;

use crate::{ClusterError, Result};

/// A node-local replica store that can execute a batch job.
pub trait BatchTarget: Send + Sync + 'static {
    /// Runs `spec` and writes its output to `out`.
    fn execute(
        &self,
        spec: &BatchJobSpec,
        registry: &JobRegistry,
        out: &mut dyn Write,
        max_exceptions: usize,
        terminate: &CancellationToken,
    ) -> Result<LocalRunOutcome>;

    /// Directory for transient result files.
    fn staging_dir(&self) -> PathBuf;
}

impl BatchTarget for Bitarchive {
    fn execute(
        &self,
        spec: &BatchJobSpec,
        registry: &JobRegistry,
        out: &mut dyn Write,
        max_exceptions: usize,
        terminate: &CancellationToken,
    ) -> Result<LocalRunOutcome> {
        let mut job = registry.instantiate(&spec.kind)?;
        let filter = spec.filter()?;
        Ok(self.run_batch(job.as_mut(), &filter, out, max_exceptions, terminate)?)
    }

    fn staging_dir(&self) -> PathBuf {
        Bitarchive::staging_dir(self)
    }
}

/// A checksum archive holds no file content, so only the listing jobs apply.
/// They are answered from the journal's current view.
impl BatchTarget for ChecksumJournal {
    fn execute(
        &self,
        spec: &BatchJobSpec,
        _registry: &JobRegistry,
        out: &mut dyn Write,
        max_exceptions: usize,
        terminate: &CancellationToken,
    ) -> Result<LocalRunOutcome> {
        if let JobKind::Custom { name, .. } = &spec.kind {
            return Err(ClusterError::Unsupported(format!(
                "checksum archives cannot run '{name}'"
            )));
        }
        let filter = spec.filter()?;
        let mut outcome = LocalRunOutcome::default();

        for entry in self.current_entries()? {
            if terminate.is_cancelled() {
                outcome.terminated = true;
                break;
            }
            if !filter.matches(&entry.filename) {
                continue;
            }
            outcome.files_processed += 1;
            let written = match spec.kind {
                JobKind::Checksum => writeln!(
                    out,
                    "{}{FILENAME_CHECKSUM_SEPARATOR}{}",
                    entry.filename, entry.checksum
                ),
                _ => writeln!(out, "{}", entry.filename),
            };
            if let Err(e) = written {
                outcome.files_failed.push(entry.filename.clone());
                if outcome.exceptions.len() < max_exceptions {
                    outcome.exceptions.push(ExceptionOccurrence {
                        phase: FailurePhase::ProcessFile,
                        filename: Some(entry.filename),
                        cause: e.to_string(),
                    });
                }
            }
        }
        out.flush()?;
        Ok(outcome)
    }

    fn staging_dir(&self) -> PathBuf {
        self.dir().join("batch")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Arc;

    use arcvault_journal::{FixedDiskSpace, JournalOptions};
    use arcvault_types::Checksum;

    use super::*;

    fn journal_with(files: &[(&str, &str)]) -> (tempfile::TempDir, ChecksumJournal) {
        let dir = tempfile::tempdir().unwrap();
        let journal = ChecksumJournal::open_with_disk_space(
            dir.path().join("journal"),
            JournalOptions::default(),
            Arc::new(FixedDiskSpace(u64::MAX / 2)),
        )
        .unwrap();
        for (name, content) in files {
            let src = dir.path().join(format!("src-{name}"));
            fs::write(&src, content).unwrap();
            journal.upload(&src, name).unwrap();
        }
        (dir, journal)
    }

    #[test]
    fn checksum_archive_answers_listing_jobs() {
        let (_dir, journal) = journal_with(&[("a.arc", "1"), ("b.warc", "2")]);
        let registry = JobRegistry::new();
        let token = CancellationToken::new();

        let mut out = Vec::new();
        let spec = BatchJobSpec::checksum().process_only_files_matching(".*\\.arc").unwrap();
        let outcome = journal.execute(&spec, &registry, &mut out, 10, &token).unwrap();
        assert_eq!(outcome.files_processed, 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("a.arc##{}\n", Checksum::of_bytes(b"1"))
        );

        let mut out = Vec::new();
        journal
            .execute(&BatchJobSpec::file_list(), &registry, &mut out, 10, &token)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "a.arc\nb.warc\n");
    }

    #[test]
    fn checksum_archive_rejects_custom_jobs() {
        let (_dir, journal) = journal_with(&[]);
        let spec = BatchJobSpec::new(JobKind::Custom {
            name: "grep".to_string(),
            args: BTreeMap::new(),
        });
        let result = journal.execute(
            &spec,
            &JobRegistry::new(),
            &mut Vec::new(),
            10,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(ClusterError::Unsupported(_))));
    }
}
