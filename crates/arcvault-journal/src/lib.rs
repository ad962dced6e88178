//! # arcvault-journal: Append-only checksum journal
//!
//! The journal backs a checksum archive: a replica that stores a checksum per
//! filename instead of the file content. Every state change is a new line in
//! an append-only log; the current value of a filename is its
//! highest-sequence `UPLOAD_COMPLETED` entry.
//!
//! # Directory Layout
//!
//! ```text
//! data_dir/
//! ├── checksum.journal        # live log, exclusively locked by the writer
//! ├── wrong_entries.journal   # entries superseded by correct()
//! ├── staging/                # transient upload copies
//! └── exports/                # materialized listings (single-use)
//! ```
//!
//! # Upload Protocol
//!
//! ```text
//! UPLOAD_STARTED ──┬──▶ UPLOAD_COMPLETED   copy verified
//!                  └──▶ UPLOAD_FAILED      mismatch, I/O error, or crash
//! ```
//!
//! A retry after a failure starts a fresh `UPLOAD_STARTED` entry; failed
//! entries are never rewritten. Listings and exports are read-only
//! projections of the index and contain each filename at most once.

mod entry;
mod error;
mod index;
mod journal;
mod space;

pub use entry::{ChecksumEntry, EntryState};
pub use error::{JournalError, Result};
pub use index::JournalIndex;
pub use journal::{
    ChecksumJournal, CorrectionOutcome, JournalOptions, LIVE_LOG_FILE, WRONG_ENTRIES_FILE,
};
pub use space::{DiskSpace, FixedDiskSpace, Fs2DiskSpace, SpaceGuard};
