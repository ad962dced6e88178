//! The checksum journal: durable log, recovery, and the upload/correct protocol.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use arcvault_batch::RemoteFile;
use arcvault_types::{Checksum, FILENAME_CHECKSUM_SEPARATOR, SequenceNumber, validate_filename};
use fs2::FileExt;

use crate::space::{DiskSpace, Fs2DiskSpace, SpaceGuard};
use crate::{ChecksumEntry, EntryState, JournalError, JournalIndex, Result};

/// Live append log.
pub const LIVE_LOG_FILE: &str = "checksum.journal";
/// Audit log of entries superseded by [`ChecksumJournal::correct`].
pub const WRONG_ENTRIES_FILE: &str = "wrong_entries.journal";
const STAGING_DIR: &str = "staging";
const EXPORTS_DIR: &str = "exports";

/// Tunables for a journal instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalOptions {
    /// Stop accepting uploads once free space drops to this many bytes.
    pub min_space_left: u64,
    /// Reject an upload that would leave less than this many bytes free.
    pub min_space_required_after_write: u64,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            min_space_left: 100 * 1024 * 1024,
            min_space_required_after_write: 10 * 1024 * 1024,
        }
    }
}

/// Result of a successful [`ChecksumJournal::correct`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionOutcome {
    /// The entry moved to the wrong-entries log, or `None` when the reference
    /// already matched and nothing was written.
    pub superseded: Option<ChecksumEntry>,
    /// The filename's current entry after the call.
    pub current: ChecksumEntry,
}

struct JournalWriter {
    live: File,
    wrong: File,
    next_seq: SequenceNumber,
}

/// Append-only, checksum-addressed record store backing a checksum archive.
///
/// All appends go through a single writer lock, so sequence numbers form a
/// total order. An entry is published to readers only after its line is on
/// disk; readers take a shared lock on the index and never wait for file I/O.
pub struct ChecksumJournal {
    dir: PathBuf,
    writer: Mutex<JournalWriter>,
    index: RwLock<JournalIndex>,
    wrong: RwLock<Vec<ChecksumEntry>>,
    space: SpaceGuard,
}

impl std::fmt::Debug for ChecksumJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumJournal")
            .field("dir", &self.dir)
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}

impl ChecksumJournal {
    /// Opens or creates the journal in `dir`, probing free space with `fs2`.
    pub fn open(dir: impl AsRef<Path>, options: JournalOptions) -> Result<Self> {
        Self::open_with_disk_space(dir, options, Arc::new(Fs2DiskSpace))
    }

    /// Opens or creates the journal in `dir` with a custom free-space probe.
    ///
    /// Replays both logs, truncates a torn final line, and closes any upload
    /// left in `UPLOAD_STARTED` by appending `UPLOAD_FAILED` for it.
    pub fn open_with_disk_space(
        dir: impl AsRef<Path>,
        options: JournalOptions,
        probe: Arc<dyn DiskSpace>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join(STAGING_DIR))?;
        fs::create_dir_all(dir.join(EXPORTS_DIR))?;

        let live_path = dir.join(LIVE_LOG_FILE);
        let mut live = open_log(&live_path)?;
        live.try_lock_exclusive()
            .map_err(|_| JournalError::Locked(live_path.clone()))?;
        let live_entries = replay(&live_path, &mut live)?;

        let wrong_path = dir.join(WRONG_ENTRIES_FILE);
        let mut wrong = open_log(&wrong_path)?;
        let wrong_entries = replay(&wrong_path, &mut wrong)?;

        let mut index = JournalIndex::new();
        let mut last: Option<SequenceNumber> = None;
        for (line, entry) in live_entries {
            if last.is_some_and(|prev| entry.sequence <= prev) {
                return Err(JournalError::Corrupt {
                    path: live_path,
                    line,
                    reason: format!(
                        "sequence {} does not follow {}",
                        entry.sequence,
                        last.unwrap_or(SequenceNumber::ZERO)
                    ),
                });
            }
            if let Some(open) = index.latest(&entry.filename)
                && !open.state.is_terminal()
                && !open.state.can_transition_to(entry.state)
            {
                return Err(JournalError::Corrupt {
                    path: live_path,
                    line,
                    reason: format!(
                        "{} for '{}' while upload {} is still open",
                        entry.state, entry.filename, open.sequence
                    ),
                });
            }
            last = Some(entry.sequence);
            index.apply(entry);
        }

        let space = SpaceGuard::new(
            &dir,
            options.min_space_left,
            options.min_space_required_after_write,
            probe,
        );
        let mut writer = JournalWriter {
            live,
            wrong,
            next_seq: last.unwrap_or(SequenceNumber::ZERO).next(),
        };

        let dangling: Vec<ChecksumEntry> = index.in_flight().into_iter().cloned().collect();
        for entry in dangling {
            tracing::warn!(
                filename = %entry.filename,
                sequence = %entry.sequence,
                "closing upload interrupted before completion"
            );
            let failed = writer.entry(&entry.filename, &entry.checksum, EntryState::UploadFailed);
            append_line(&mut writer.live, &failed.to_line())?;
            writer.next_seq = writer.next_seq.next();
            index.apply(failed);
        }

        tracing::info!(
            dir = %dir.display(),
            entries = index.len(),
            files = index.file_count(),
            wrong_entries = wrong_entries.len(),
            "opened checksum journal"
        );

        Ok(Self {
            dir,
            writer: Mutex::new(writer),
            index: RwLock::new(index),
            wrong: RwLock::new(wrong_entries.into_iter().map(|(_, e)| e).collect()),
            space,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records `source` under `filename`.
    ///
    /// Appends `UPLOAD_STARTED`, writes and re-reads a copy of the file, then
    /// appends `UPLOAD_COMPLETED` if the copy hashes to the source checksum
    /// and `UPLOAD_FAILED` otherwise. Uploading a filename whose current
    /// checksum already equals the source's is a no-op returning that entry.
    pub fn upload(&self, source: &Path, filename: &str) -> Result<ChecksumEntry> {
        validate_filename(filename)?;
        let size = fs::metadata(source)
            .ok()
            .filter(fs::Metadata::is_file)
            .ok_or_else(|| {
                JournalError::InvalidArgument(format!(
                    "upload source {} is not a readable file",
                    source.display()
                ))
            })?
            .len();
        self.space.check_write(size)?;
        let checksum = Checksum::of_file(source)?;

        {
            let mut writer = self.lock_writer()?;
            let index = self.index.read().map_err(|_| JournalError::poisoned())?;
            if let Some(current) = index.current(filename) {
                if current.checksum == checksum {
                    tracing::debug!(filename, "file already recorded with the same checksum");
                    return Ok(current.clone());
                }
                return Err(JournalError::IllegalState(format!(
                    "'{filename}' is already recorded with checksum {}; use correct to replace it",
                    current.checksum
                )));
            }
            if index.is_in_flight(filename) {
                return Err(JournalError::IllegalState(format!(
                    "an upload of '{filename}' is already in progress"
                )));
            }
            drop(index);
            self.append(&mut writer, filename, &checksum, EntryState::UploadStarted)?;
        }

        let verified = self.write_and_verify(source);

        let mut writer = self.lock_writer()?;
        match verified {
            Ok(written) if written == checksum => {
                match self.append(&mut writer, filename, &checksum, EntryState::UploadCompleted) {
                    Ok(entry) => Ok(entry),
                    Err(e) => {
                        self.fail_upload(&mut writer, filename, &checksum);
                        Err(JournalError::UploadFailed {
                            filename: filename.to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
            Ok(written) => {
                self.fail_upload(&mut writer, filename, &checksum);
                Err(JournalError::ChecksumMismatch {
                    filename: filename.to_string(),
                    expected: checksum,
                    actual: written,
                })
            }
            Err(e) => {
                self.fail_upload(&mut writer, filename, &checksum);
                Err(JournalError::UploadFailed {
                    filename: filename.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Whether `filename` has a current completed entry.
    pub fn has_entry(&self, filename: &str) -> Result<bool> {
        let index = self.index.read().map_err(|_| JournalError::poisoned())?;
        Ok(index.current(filename).is_some())
    }

    /// The checksum of the current completed entry for `filename`.
    pub fn get_checksum(&self, filename: &str) -> Result<Checksum> {
        let index = self.index.read().map_err(|_| JournalError::poisoned())?;
        index
            .current(filename)
            .map(|e| e.checksum.clone())
            .ok_or_else(|| JournalError::UnknownFile(filename.to_string()))
    }

    /// Replaces the checksum recorded for `filename` with that of `reference`.
    ///
    /// The superseded entry is copied verbatim to the wrong-entries log before
    /// the new `UPLOAD_COMPLETED` entry is appended. Fails with
    /// [`JournalError::IllegalState`] and writes nothing when `filename` has no
    /// current entry.
    pub fn correct(&self, filename: &str, reference: &Path) -> Result<CorrectionOutcome> {
        validate_filename(filename)?;
        if !reference.is_file() {
            return Err(JournalError::InvalidArgument(format!(
                "reference {} is not a readable file",
                reference.display()
            )));
        }
        let checksum = Checksum::of_file(reference)?;

        let mut writer = self.lock_writer()?;
        let index = self.index.read().map_err(|_| JournalError::poisoned())?;
        if index.is_in_flight(filename) {
            return Err(JournalError::IllegalState(format!(
                "cannot correct '{filename}' while an upload is in progress"
            )));
        }
        let Some(old) = index.current(filename).cloned() else {
            return Err(JournalError::IllegalState(format!(
                "cannot correct '{filename}': no entry exists for it"
            )));
        };
        drop(index);

        if old.checksum == checksum {
            tracing::debug!(filename, "reference matches current checksum, nothing to correct");
            return Ok(CorrectionOutcome {
                superseded: None,
                current: old,
            });
        }

        // The audit copy is withdrawn again if the live append fails.
        let wrong_len = writer.wrong.metadata()?.len();
        append_line(&mut writer.wrong, &old.to_line())?;
        let current = match self.append(&mut writer, filename, &checksum, EntryState::UploadCompleted) {
            Ok(entry) => entry,
            Err(e) => {
                if let Err(undo) = writer.wrong.set_len(wrong_len).and_then(|()| writer.wrong.sync_data()) {
                    tracing::warn!(filename, error = %undo, "could not withdraw wrong-entries line");
                }
                return Err(e);
            }
        };
        self.wrong
            .write()
            .map_err(|_| JournalError::poisoned())?
            .push(old.clone());

        tracing::info!(
            filename,
            old = %old.checksum,
            new = %current.checksum,
            "corrected checksum entry"
        );
        Ok(CorrectionOutcome {
            superseded: Some(old),
            current,
        })
    }

    /// Materializes the current filenames, one per line, sorted.
    pub fn list_all_filenames(&self) -> Result<RemoteFile> {
        let body: String = self
            .current_entries()?
            .iter()
            .map(|e| format!("{}\n", e.filename))
            .collect();
        self.export("filenames", &body)
    }

    /// Materializes the current view as `filename##checksum` lines, sorted.
    pub fn list_all_checksums(&self) -> Result<RemoteFile> {
        let body: String = self
            .current_entries()?
            .iter()
            .map(|e| format!("{}{FILENAME_CHECKSUM_SEPARATOR}{}\n", e.filename, e.checksum))
            .collect();
        self.export("checksums", &body)
    }

    /// Materializes the current view in journal line format, sorted by filename.
    pub fn export_archive(&self) -> Result<RemoteFile> {
        let body: String = self
            .current_entries()?
            .iter()
            .map(|e| format!("{}\n", e.to_line()))
            .collect();
        self.export("archive", &body)
    }

    /// Materializes the wrong-entries log as `filename##checksum` lines, in
    /// the order the entries were superseded.
    pub fn list_wrong_entries(&self) -> Result<RemoteFile> {
        let body: String = self
            .wrong_entries()?
            .iter()
            .map(|e| format!("{}{FILENAME_CHECKSUM_SEPARATOR}{}\n", e.filename, e.checksum))
            .collect();
        self.export("wrong-entries", &body)
    }

    /// The current entry of every recorded file, sorted by filename.
    pub fn current_entries(&self) -> Result<Vec<ChecksumEntry>> {
        let index = self.index.read().map_err(|_| JournalError::poisoned())?;
        Ok(index.current_entries())
    }

    /// Every live-log entry for `filename`, in sequence order.
    pub fn history(&self, filename: &str) -> Result<Vec<ChecksumEntry>> {
        let index = self.index.read().map_err(|_| JournalError::poisoned())?;
        Ok(index.history(filename))
    }

    /// Entries superseded by corrections, oldest first.
    pub fn wrong_entries(&self) -> Result<Vec<ChecksumEntry>> {
        let wrong = self.wrong.read().map_err(|_| JournalError::poisoned())?;
        Ok(wrong.clone())
    }

    /// Number of entries in the live log.
    pub fn len(&self) -> Result<usize> {
        let index = self.index.read().map_err(|_| JournalError::poisoned())?;
        Ok(index.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Whether the journal directory has room to accept uploads.
    pub fn has_enough_space(&self) -> bool {
        self.space.has_enough_space()
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, JournalWriter>> {
        self.writer.lock().map_err(|_| JournalError::poisoned())
    }

    /// Appends one entry to the live log and publishes it.
    ///
    /// Must be called with the writer lock held.
    fn append(
        &self,
        writer: &mut JournalWriter,
        filename: &str,
        checksum: &Checksum,
        state: EntryState,
    ) -> Result<ChecksumEntry> {
        let entry = writer.entry(filename, checksum, state);
        append_line(&mut writer.live, &entry.to_line())?;
        writer.next_seq = writer.next_seq.next();
        self.index
            .write()
            .map_err(|_| JournalError::poisoned())?
            .apply(entry.clone());
        tracing::debug!(filename, state = %state, sequence = %entry.sequence, "appended journal entry");
        Ok(entry)
    }

    fn fail_upload(&self, writer: &mut JournalWriter, filename: &str, checksum: &Checksum) {
        tracing::warn!(filename, "upload failed");
        if let Err(e) = self.append(writer, filename, checksum, EntryState::UploadFailed) {
            // The entry stays UPLOAD_STARTED until the next open closes it.
            tracing::warn!(filename, error = %e, "could not record failed upload");
        }
    }

    /// Writes a durable copy of `source` to staging and returns the checksum
    /// of what was read back.
    fn write_and_verify(&self, source: &Path) -> io::Result<Checksum> {
        let mut copy = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(self.dir.join(STAGING_DIR))?;
        io::copy(&mut File::open(source)?, copy.as_file_mut())?;
        copy.as_file_mut().sync_all()?;
        Checksum::of_file(copy.path())
    }

    fn export(&self, label: &str, body: &str) -> Result<RemoteFile> {
        let file = RemoteFile::stage(&self.dir.join(EXPORTS_DIR), label, &mut body.as_bytes())?;
        Ok(file)
    }
}

impl JournalWriter {
    fn entry(&self, filename: &str, checksum: &Checksum, state: EntryState) -> ChecksumEntry {
        ChecksumEntry {
            filename: filename.to_string(),
            checksum: checksum.clone(),
            state,
            sequence: self.next_seq,
        }
    }
}

fn open_log(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?)
}

/// Parses every complete line of `file`, truncating a torn final line.
fn replay(path: &Path, file: &mut File) -> Result<Vec<(usize, ChecksumEntry)>> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;

    let complete_len = content.rfind('\n').map_or(0, |i| i + 1);
    if complete_len < content.len() {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = content.len() - complete_len,
            "truncating torn final journal line"
        );
        file.set_len(complete_len as u64)?;
        file.sync_data()?;
        content.truncate(complete_len);
    }

    content
        .lines()
        .enumerate()
        .map(|(i, line)| {
            ChecksumEntry::parse_line(line)
                .map(|e| (i + 1, e))
                .map_err(|reason| JournalError::Corrupt {
                    path: path.to_path_buf(),
                    line: i + 1,
                    reason,
                })
        })
        .collect()
}

/// Appends `line` durably. On failure the file is cut back to its prior length
/// so no partial line is left behind.
fn append_line(file: &mut File, line: &str) -> Result<()> {
    let before = file.metadata()?.len();
    let written = file
        .write_all(format!("{line}\n").as_bytes())
        .and_then(|()| file.sync_data());
    if let Err(e) = written {
        if let Err(undo) = file.set_len(before) {
            tracing::warn!(error = %undo, "could not roll back partial journal line");
        }
        return Err(e.into());
    }
    Ok(())
}
