//! The per-node directory store.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arcvault_batch::{BatchJob, FilenameFilter, LocalRunOutcome, RemoteFile, run_local};
use arcvault_journal::{DiskSpace, Fs2DiskSpace, SpaceGuard};
use arcvault_types::{Checksum, validate_filename};
use tokio_util::sync::CancellationToken;

use crate::record::{ArchiveRecordHandle, read_record};
use crate::{BitarchiveError, Result};

const FILE_DIR: &str = "filedir";
const TEMP_DIR: &str = "tempdir";
const ATTIC_DIR: &str = "atticdir";
const STAGING_DIR: &str = "staging";

/// Tunables for a bitarchive store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitarchiveOptions {
    pub min_space_left: u64,
    pub min_space_required_after_write: u64,
    /// Record bodies up to this many bytes are returned in memory.
    pub record_memory_threshold: u64,
}

impl Default for BitarchiveOptions {
    fn default() -> Self {
        Self {
            min_space_left: 100 * 1024 * 1024,
            min_space_required_after_write: 10 * 1024 * 1024,
            record_memory_threshold: 1024 * 1024,
        }
    }
}

/// Archive files stored under one directory of one storage node.
///
/// ```text
/// root/
/// ├── filedir/    stored files
/// ├── tempdir/    uploads in progress, moved into filedir when complete
/// ├── atticdir/   files taken out by remove_and_get
/// └── staging/    transient files behind single-use handles
/// ```
#[derive(Debug)]
pub struct Bitarchive {
    root: PathBuf,
    options: BitarchiveOptions,
    space: SpaceGuard,
    // Serializes the existence check and the move of upload/remove.
    mutation: Mutex<()>,
}

impl Bitarchive {
    pub fn open(root: impl AsRef<Path>, options: BitarchiveOptions) -> Result<Self> {
        Self::open_with_disk_space(root, options, Arc::new(Fs2DiskSpace))
    }

    pub fn open_with_disk_space(
        root: impl AsRef<Path>,
        options: BitarchiveOptions,
        probe: Arc<dyn DiskSpace>,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in [FILE_DIR, TEMP_DIR, ATTIC_DIR, STAGING_DIR] {
            fs::create_dir_all(root.join(sub))?;
        }
        let space = SpaceGuard::new(
            root.join(FILE_DIR),
            options.min_space_left,
            options.min_space_required_after_write,
            probe,
        );
        tracing::info!(root = %root.display(), "opened bitarchive");
        Ok(Self {
            root,
            options,
            space,
            mutation: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn has_enough_space(&self) -> bool {
        self.space.has_enough_space()
    }

    /// Stores a copy of `source` as `filename`. Refuses files already stored.
    ///
    /// The copy is written to `tempdir/` first and renamed into `filedir/`
    /// only when complete, so `filedir/` never holds a partial file.
    pub fn upload(&self, source: &Path, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        let size = fs::metadata(source)
            .map_err(|e| {
                BitarchiveError::InvalidArgument(format!(
                    "upload source {} is not readable: {e}",
                    source.display()
                ))
            })?
            .len();
        self.space.check_write(size)?;

        let destination = self.root.join(FILE_DIR).join(filename);
        let _guard = self.mutation.lock().map_err(|_| BitarchiveError::poisoned())?;
        if destination.exists() {
            tracing::warn!(filename, "upload refused, file already stored");
            return Err(BitarchiveError::AlreadyStored(filename.to_string()));
        }

        let mut temp = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(self.root.join(TEMP_DIR))?;
        io::copy(&mut File::open(source)?, temp.as_file_mut())?;
        temp.as_file_mut().sync_all()?;
        temp.persist(&destination).map_err(|e| BitarchiveError::Io(e.error))?;

        tracing::info!(filename, bytes = size, "stored file");
        Ok(destination)
    }

    /// Path of a stored file, if this store holds it.
    pub fn lookup(&self, filename: &str) -> Option<PathBuf> {
        validate_filename(filename).ok()?;
        let path = self.root.join(FILE_DIR).join(filename);
        path.is_file().then_some(path)
    }

    /// Every stored file, sorted by name.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.root.join(FILE_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Retrieves the record at `offset` of a stored file.
    pub fn get_record(&self, filename: &str, offset: u64) -> Result<ArchiveRecordHandle> {
        let path = self
            .lookup(filename)
            .ok_or_else(|| BitarchiveError::UnknownFile(filename.to_string()))?;
        read_record(
            &path,
            filename,
            offset,
            self.options.record_memory_threshold,
            &self.staging_dir(),
        )
    }

    /// Takes a stored file out of the archive, returning its content.
    ///
    /// The stored copy must hash to `expected`; the file is moved to the attic
    /// rather than deleted.
    pub fn remove_and_get(&self, filename: &str, expected: &Checksum) -> Result<RemoteFile> {
        let _guard = self.mutation.lock().map_err(|_| BitarchiveError::poisoned())?;
        let path = self
            .lookup(filename)
            .ok_or_else(|| BitarchiveError::UnknownFile(filename.to_string()))?;

        let actual = Checksum::of_file(&path)?;
        if &actual != expected {
            return Err(BitarchiveError::ChecksumMismatch {
                filename: filename.to_string(),
                expected: expected.clone(),
                actual,
            });
        }

        let attic = self.attic_path(filename);
        fs::rename(&path, &attic)?;
        tracing::info!(filename, attic = %attic.display(), "removed file to attic");

        let copy = RemoteFile::stage(&self.staging_dir(), filename, &mut File::open(&attic)?)?;
        Ok(copy)
    }

    /// First free attic name for `filename`: the name itself, then `name.1`,
    /// `name.2` and so on. Called with the mutation lock held.
    fn attic_path(&self, filename: &str) -> PathBuf {
        let attic = self.root.join(ATTIC_DIR);
        let mut candidate = attic.join(filename);
        let mut generation = 0u32;
        while candidate.exists() {
            generation += 1;
            candidate = attic.join(format!("{filename}.{generation}"));
        }
        candidate
    }

    /// Runs `job` over every stored file that passes `filter`.
    pub fn run_batch(
        &self,
        job: &mut dyn BatchJob,
        filter: &FilenameFilter,
        out: &mut dyn Write,
        max_exceptions: usize,
        terminate: &CancellationToken,
    ) -> Result<LocalRunOutcome> {
        let files = self.files()?;
        Ok(run_local(job, filter, files, out, max_exceptions, terminate))
    }
}
