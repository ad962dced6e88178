//! The batch job contract and the built-in jobs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use arcvault_types::{Checksum, FILENAME_CHECKSUM_SEPARATOR};

use crate::{BatchError, JobKind, Result};

/// Work run by a storage node over each selected local file.
///
/// Jobs are stateful only for the duration of one node-local run. All
/// output goes to the writer the runner passes in; the coordinator
/// concatenates per-node outputs and may then call [`BatchJob::post_process`]
/// on the aggregate.
pub trait BatchJob: Send {
    /// Called once before the first file.
    fn initialize(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// Processes one file. An error marks the file as failed; the run continues.
    fn process_file(&mut self, file: &Path, out: &mut dyn Write) -> io::Result<()>;

    /// Called once after the last file.
    fn finish(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// Merges the aggregated output of all nodes.
    ///
    /// Returns `false` if the job has no merge step, in which case the
    /// aggregate is used as-is and `output` is left untouched.
    fn post_process(&self, _input: &mut dyn Read, _output: &mut dyn Write) -> io::Result<bool> {
        Ok(false)
    }
}

fn file_name(file: &Path) -> io::Result<&str> {
    file.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::other(format!("'{}' has no utf-8 file name", file.display())))
}

/// Sorts and de-duplicates lines. Shared merge step of the listing jobs.
fn sorted_unique_lines(input: &mut dyn Read, output: &mut dyn Write) -> io::Result<bool> {
    let mut lines = BTreeSet::new();
    for line in BufReader::new(input).lines() {
        let line = line?;
        if !line.is_empty() {
            lines.insert(line);
        }
    }
    for line in lines {
        writeln!(output, "{line}")?;
    }
    Ok(true)
}

/// Lists the names of the selected files.
#[derive(Debug, Default)]
pub struct FileListJob;

impl BatchJob for FileListJob {
    fn process_file(&mut self, file: &Path, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "{}", file_name(file)?)
    }

    fn post_process(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<bool> {
        sorted_unique_lines(input, output)
    }
}

/// Computes a checksum per selected file, as `filename##checksum` lines.
#[derive(Debug, Default)]
pub struct ChecksumJob;

impl BatchJob for ChecksumJob {
    fn process_file(&mut self, file: &Path, out: &mut dyn Write) -> io::Result<()> {
        let name = file_name(file)?;
        let checksum = Checksum::of_file(file)?;
        writeln!(out, "{name}{FILENAME_CHECKSUM_SEPARATOR}{checksum}")
    }

    fn post_process(&self, input: &mut dyn Read, output: &mut dyn Write) -> io::Result<bool> {
        sorted_unique_lines(input, output)
    }
}

type JobFactory = dyn Fn(&BTreeMap<String, String>) -> Result<Box<dyn BatchJob>> + Send + Sync;

/// Maps job kinds to runnable jobs.
///
/// The built-in kinds are always available; custom jobs must be registered
/// on every node (and on the coordinator, for their merge step) under the
/// same name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    custom: HashMap<String, Arc<JobFactory>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom job. Re-registering a name is an error.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&BTreeMap<String, String>) -> Result<Box<dyn BatchJob>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.custom.contains_key(&name) {
            return Err(BatchError::IllegalState(format!(
                "batch job '{name}' is already registered"
            )));
        }
        self.custom.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Instantiates a fresh job for one run.
    pub fn instantiate(&self, kind: &JobKind) -> Result<Box<dyn BatchJob>> {
        match kind {
            JobKind::FileList => Ok(Box::new(FileListJob)),
            JobKind::Checksum => Ok(Box::new(ChecksumJob)),
            JobKind::Custom { name, args } => {
                let factory = self
                    .custom
                    .get(name)
                    .ok_or_else(|| BatchError::UnknownJob(name.clone()))?;
                factory(args)
            }
        }
    }
}
