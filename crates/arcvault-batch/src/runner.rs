//! Node-local execution of a batch job over a set of files.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{BatchJob, FilenameFilter};

/// Default cap on recorded exceptions per run.
pub const DEFAULT_MAX_EXCEPTIONS: usize = 100;

/// Where in a run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Initialize,
    ProcessFile,
    Finish,
}

/// One recorded failure of a node-local run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionOccurrence {
    pub phase: FailurePhase,
    /// The failing file, for `ProcessFile` failures.
    pub filename: Option<String>,
    pub cause: String,
}

/// Outcome of running a job on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRunOutcome {
    /// Files the job was applied to, failed ones included.
    pub files_processed: usize,
    /// Names of files whose processing failed.
    pub files_failed: Vec<String>,
    /// Recorded failures, capped at the run's `max_exceptions`.
    pub exceptions: Vec<ExceptionOccurrence>,
    /// The run was stopped early by an operator.
    pub terminated: bool,
}

impl LocalRunOutcome {
    pub fn is_ok(&self) -> bool {
        self.files_failed.is_empty() && self.exceptions.is_empty()
    }

    fn record(&mut self, occurrence: ExceptionOccurrence, max_exceptions: usize) {
        if self.exceptions.len() < max_exceptions {
            self.exceptions.push(occurrence);
        } else {
            tracing::trace!(?occurrence, "exception not recorded, cap reached");
        }
    }
}

/// Runs `job` over every file in `files` whose name passes `filter`.
///
/// Files are visited in the given order. The run checks `terminate` between
/// files and stops early when it fires; output written so far is kept.
pub fn run_local(
    job: &mut dyn BatchJob,
    filter: &FilenameFilter,
    files: impl IntoIterator<Item = PathBuf>,
    out: &mut dyn Write,
    max_exceptions: usize,
    terminate: &CancellationToken,
) -> LocalRunOutcome {
    let mut outcome = LocalRunOutcome::default();

    if let Err(e) = job.initialize(out) {
        outcome.record(
            ExceptionOccurrence {
                phase: FailurePhase::Initialize,
                filename: None,
                cause: e.to_string(),
            },
            max_exceptions,
        );
    }

    for file in files {
        if terminate.is_cancelled() {
            tracing::info!(processed = outcome.files_processed, "batch run terminated");
            outcome.terminated = true;
            break;
        }
        let Some(name) = selected_name(&file, filter) else {
            continue;
        };
        outcome.files_processed += 1;
        if let Err(e) = job.process_file(&file, out) {
            tracing::debug!(filename = %name, error = %e, "batch job failed on file");
            outcome.files_failed.push(name.clone());
            outcome.record(
                ExceptionOccurrence {
                    phase: FailurePhase::ProcessFile,
                    filename: Some(name),
                    cause: e.to_string(),
                },
                max_exceptions,
            );
        }
    }

    if let Err(e) = job.finish(out).and_then(|()| out.flush()) {
        outcome.record(
            ExceptionOccurrence {
                phase: FailurePhase::Finish,
                filename: None,
                cause: e.to_string(),
            },
            max_exceptions,
        );
    }

    outcome
}

fn selected_name(file: &Path, filter: &FilenameFilter) -> Option<String> {
    let name = file.file_name()?.to_str()?;
    filter.matches(name).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io;

    use super::*;
    use crate::{BatchJobSpec, ChecksumJob, FileListJob};

    fn fixture(names: &[&str]) -> (tempfile::TempDir, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = names
            .iter()
            .map(|n| {
                let p = dir.path().join(n);
                fs::write(&p, n.as_bytes()).unwrap();
                p
            })
            .collect();
        (dir, paths)
    }

    #[test]
    fn runs_only_selected_files() {
        let (_dir, files) = fixture(&["a.arc", "b.warc", "c.arc"]);
        let filter = BatchJobSpec::file_list()
            .process_only_files_matching(".*\\.arc")
            .unwrap()
            .filter()
            .unwrap();

        let mut out = Vec::new();
        let outcome = run_local(
            &mut FileListJob,
            &filter,
            files,
            &mut out,
            DEFAULT_MAX_EXCEPTIONS,
            &CancellationToken::new(),
        );

        assert_eq!(outcome.files_processed, 2);
        assert!(outcome.is_ok());
        assert_eq!(String::from_utf8(out).unwrap(), "a.arc\nc.arc\n");
    }

    #[test]
    fn failed_files_are_reported_and_run_continues() {
        let (dir, mut files) = fixture(&["a.arc"]);
        files.insert(0, dir.path().join("missing.arc"));
        let filter = BatchJobSpec::checksum().filter().unwrap();

        let mut out = Vec::new();
        let outcome = run_local(
            &mut ChecksumJob,
            &filter,
            files,
            &mut out,
            DEFAULT_MAX_EXCEPTIONS,
            &CancellationToken::new(),
        );

        assert_eq!(outcome.files_processed, 2);
        assert_eq!(outcome.files_failed, vec!["missing.arc".to_string()]);
        assert_eq!(outcome.exceptions.len(), 1);
        assert_eq!(outcome.exceptions[0].phase, FailurePhase::ProcessFile);
        assert!(String::from_utf8(out).unwrap().starts_with("a.arc##"));
    }

    #[test]
    fn exceptions_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..5).map(|i| dir.path().join(format!("{i}.arc"))).collect();
        let filter = BatchJobSpec::checksum().filter().unwrap();

        let outcome = run_local(
            &mut ChecksumJob,
            &filter,
            files,
            &mut io::sink(),
            2,
            &CancellationToken::new(),
        );
        assert_eq!(outcome.files_failed.len(), 5);
        assert_eq!(outcome.exceptions.len(), 2);
    }

    #[test]
    fn termination_stops_between_files() {
        let (_dir, files) = fixture(&["a.arc", "b.arc"]);
        let filter = BatchJobSpec::file_list().filter().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = run_local(
            &mut FileListJob,
            &filter,
            files,
            &mut io::sink(),
            DEFAULT_MAX_EXCEPTIONS,
            &token,
        );
        assert!(outcome.terminated);
        assert_eq!(outcome.files_processed, 0);
    }
}
