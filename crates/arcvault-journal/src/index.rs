//! In-memory view of the journal: the append log plus derived lookups.
//!
//! The [`JournalIndex`] keeps every live-log entry in append order and maps
//! each filename to two positions in that log: its latest entry of any state,
//! and its latest `UPLOAD_COMPLETED` entry. The latter is the filename's
//! *current* entry. Later appends shadow earlier ones; nothing is ever
//! rewritten in place.
//!
//! # Invariants
//!
//! - Entries are ordered by strictly increasing sequence number
//! - `latest[f]` and `current[f]` are the highest positions for `f` in `entries`
//!   among all entries, respectively among completed entries

use std::collections::HashMap;

use arcvault_types::SequenceNumber;

use crate::{ChecksumEntry, EntryState};

/// Append log plus per-filename resolution.
#[derive(Debug, Default, Clone)]
pub struct JournalIndex {
    entries: Vec<ChecksumEntry>,
    latest: HashMap<String, usize>,
    current: HashMap<String, usize>,
}

impl JournalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an entry that has already been durably appended.
    ///
    /// # Panics
    ///
    /// Debug builds panic if `entry.sequence` does not exceed the last sequence.
    pub fn apply(&mut self, entry: ChecksumEntry) {
        debug_assert!(
            self.last_sequence().is_none_or(|last| entry.sequence > last),
            "sequence {} must be greater than last sequence {:?}",
            entry.sequence,
            self.last_sequence()
        );

        let position = self.entries.len();
        self.latest.insert(entry.filename.clone(), position);
        if entry.state == EntryState::UploadCompleted {
            self.current.insert(entry.filename.clone(), position);
        }
        self.entries.push(entry);
    }

    /// The filename's current entry: its highest-sequence completed entry.
    pub fn current(&self, filename: &str) -> Option<&ChecksumEntry> {
        self.current.get(filename).map(|&i| &self.entries[i])
    }

    /// The filename's highest-sequence entry of any state.
    pub fn latest(&self, filename: &str) -> Option<&ChecksumEntry> {
        self.latest.get(filename).map(|&i| &self.entries[i])
    }

    /// Whether an upload attempt for `filename` has started but not ended.
    pub fn is_in_flight(&self, filename: &str) -> bool {
        self.latest(filename)
            .is_some_and(|e| !e.state.is_terminal())
    }

    /// Filenames whose latest entry is `UPLOAD_STARTED`.
    pub fn in_flight(&self) -> Vec<&ChecksumEntry> {
        let mut dangling: Vec<&ChecksumEntry> = self
            .latest
            .values()
            .map(|&i| &self.entries[i])
            .filter(|e| !e.state.is_terminal())
            .collect();
        dangling.sort_by_key(|e| e.sequence);
        dangling
    }

    /// The deduplicated current view, one entry per filename, sorted by filename.
    pub fn current_entries(&self) -> Vec<ChecksumEntry> {
        let mut view: Vec<ChecksumEntry> = self
            .current
            .values()
            .map(|&i| self.entries[i].clone())
            .collect();
        view.sort_by(|a, b| a.filename.cmp(&b.filename));
        view
    }

    /// Every live-log entry for `filename`, in append order.
    pub fn history(&self, filename: &str) -> Vec<ChecksumEntry> {
        self.entries
            .iter()
            .filter(|e| e.filename == filename)
            .cloned()
            .collect()
    }

    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.entries.last().map(|e| e.sequence)
    }

    /// Number of entries in the append log, superseded ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of filenames with a current entry.
    pub fn file_count(&self) -> usize {
        self.current.len()
    }
}

#[cfg(test)]
mod tests {
    use arcvault_types::Checksum;
    use proptest::prelude::*;

    use super::*;

    fn entry(name: &str, sum: &[u8], state: EntryState, seq: u64) -> ChecksumEntry {
        ChecksumEntry {
            filename: name.to_string(),
            checksum: Checksum::of_bytes(sum),
            state,
            sequence: SequenceNumber::new(seq),
        }
    }

    #[test]
    fn later_completed_entry_shadows_earlier() {
        let mut index = JournalIndex::new();
        index.apply(entry("a.arc", b"1", EntryState::UploadCompleted, 1));
        index.apply(entry("b.arc", b"x", EntryState::UploadCompleted, 2));
        index.apply(entry("a.arc", b"2", EntryState::UploadCompleted, 3));

        assert_eq!(
            index.current("a.arc").unwrap().checksum,
            Checksum::of_bytes(b"2")
        );
        let view = index.current_entries();
        assert_eq!(view.len(), 2);
        assert_eq!(view.iter().filter(|e| e.filename == "a.arc").count(), 1);
        assert_eq!(index.len(), 3);
        assert_eq!(index.history("a.arc").len(), 2);
    }

    #[test]
    fn started_and_failed_entries_are_not_current() {
        let mut index = JournalIndex::new();
        index.apply(entry("a.arc", b"1", EntryState::UploadStarted, 1));
        assert!(index.current("a.arc").is_none());
        assert!(index.is_in_flight("a.arc"));

        index.apply(entry("a.arc", b"1", EntryState::UploadFailed, 2));
        assert!(index.current("a.arc").is_none());
        assert!(!index.is_in_flight("a.arc"));
        assert!(index.current_entries().is_empty());
    }

    #[test]
    fn in_flight_lists_dangling_uploads_in_order() {
        let mut index = JournalIndex::new();
        index.apply(entry("b.arc", b"1", EntryState::UploadStarted, 1));
        index.apply(entry("a.arc", b"1", EntryState::UploadStarted, 2));
        index.apply(entry("c.arc", b"1", EntryState::UploadStarted, 3));
        index.apply(entry("c.arc", b"1", EntryState::UploadCompleted, 4));

        let names: Vec<&str> = index.in_flight().iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["b.arc", "a.arc"]);
    }

    fn state_strategy() -> impl Strategy<Value = EntryState> {
        prop_oneof![
            Just(EntryState::UploadStarted),
            Just(EntryState::UploadFailed),
            Just(EntryState::UploadCompleted),
        ]
    }

    proptest! {
        #[test]
        fn current_is_highest_sequence_completed(
            appends in proptest::collection::vec((state_strategy(), 0u8..4), 0..40)
        ) {
            let mut index = JournalIndex::new();
            let mut expected = None;
            for (seq, (state, sum)) in appends.iter().enumerate() {
                let e = entry("f.arc", &[*sum], *state, seq as u64 + 1);
                if *state == EntryState::UploadCompleted {
                    expected = Some(e.checksum.clone());
                }
                index.apply(e);
            }

            prop_assert_eq!(index.current("f.arc").map(|e| e.checksum.clone()), expected.clone());
            let view = index.current_entries();
            prop_assert_eq!(view.len(), usize::from(expected.is_some()));
        }
    }
}
