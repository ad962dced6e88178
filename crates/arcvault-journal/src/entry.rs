//! Journal entries and their line format.
//!
//! Each entry is persisted as one human-readable line:
//!
//! ```text
//! <filename> <checksum> <STATE> <sequence>
//! TEST1.arc 9f86d081884c7d65...0f00a08 UPLOAD_COMPLETED 2
//! ```
//!
//! The wrong-entries log uses the identical format.

use std::fmt::Display;
use std::str::FromStr;

use arcvault_types::{Checksum, SequenceNumber, validate_filename};

/// Upload state recorded by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    UploadStarted,
    UploadFailed,
    UploadCompleted,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadStarted => "UPLOAD_STARTED",
            Self::UploadFailed => "UPLOAD_FAILED",
            Self::UploadCompleted => "UPLOAD_COMPLETED",
        }
    }

    /// Whether an upload attempt in state `self` may move to `next`.
    ///
    /// Only `UPLOAD_STARTED` moves, and only forward to a terminal state.
    pub fn can_transition_to(self, next: EntryState) -> bool {
        matches!(
            (self, next),
            (Self::UploadStarted, Self::UploadCompleted | Self::UploadFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::UploadStarted)
    }
}

impl Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOAD_STARTED" => Ok(Self::UploadStarted),
            "UPLOAD_FAILED" => Ok(Self::UploadFailed),
            "UPLOAD_COMPLETED" => Ok(Self::UploadCompleted),
            other => Err(format!("unknown entry state '{other}'")),
        }
    }
}

/// One immutable record of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChecksumEntry {
    pub filename: String,
    pub checksum: Checksum,
    pub state: EntryState,
    pub sequence: SequenceNumber,
}

impl ChecksumEntry {
    /// Encodes the entry as a line, without the trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.filename, self.checksum, self.state, self.sequence
        )
    }

    /// Parses a line produced by [`ChecksumEntry::to_line`].
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split(' ').collect();
        let [filename, checksum, state, sequence] = fields.as_slice() else {
            return Err(format!("expected 4 fields, found {}", fields.len()));
        };
        validate_filename(filename).map_err(|e| e.to_string())?;
        let checksum = Checksum::parse(*checksum).map_err(|e| e.to_string())?;
        let state = state.parse()?;
        let sequence = sequence
            .parse::<u64>()
            .map_err(|e| format!("bad sequence number '{sequence}': {e}"))?;
        Ok(Self {
            filename: (*filename).to_string(),
            checksum,
            state,
            sequence: SequenceNumber::new(sequence),
        })
    }
}
