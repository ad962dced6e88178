//! # arcvault-types: Core types for `arcvault`
//!
//! This crate contains shared types used across the `arcvault` system:
//! - Identities ([`NodeId`], [`ReplicaId`], [`StorageNodeIdentity`], [`RoundId`])
//! - Replica configuration ([`Replica`], [`ReplicaKind`])
//! - Temporal types ([`Timestamp`])
//! - Journal ordering ([`SequenceNumber`])
//! - Content digests ([`Checksum`])
//! - Archive filename rules ([`validate_filename`], [`FILENAME_CHECKSUM_SEPARATOR`])

use std::{
    fmt::Display,
    fs::File,
    io::{self, Read},
    path::Path,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Separator between filename and checksum in checksum listings.
///
/// Checksum batch jobs and checksum-archive exports both emit one
/// `filename##checksum` line per file.
pub const FILENAME_CHECKSUM_SEPARATOR: &str = "##";

/// Errors raised when constructing a core type from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidValue {
    #[error("{what} must not be empty")]
    Empty { what: &'static str },

    #[error("{what} '{value}' contains whitespace")]
    Whitespace { what: &'static str, value: String },

    #[error("{what} '{value}' contains the reserved sequence '{reserved}'")]
    Reserved {
        what: &'static str,
        value: String,
        reserved: &'static str,
    },

    #[error("checksum '{0}' is not lowercase hexadecimal")]
    NotHex(String),
}

fn check_token(what: &'static str, value: &str) -> Result<(), InvalidValue> {
    if value.is_empty() {
        return Err(InvalidValue::Empty { what });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(InvalidValue::Whitespace {
            what,
            value: value.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Identities
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates the identifier, rejecting empty or whitespace-bearing values.
            pub fn new(value: impl Into<String>) -> Result<Self, InvalidValue> {
                let value = value.into();
                check_token($what, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = InvalidValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidValue;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id!(
    /// Identifier of one storage process (a bitarchive or checksum-archive node).
    NodeId,
    "node id"
);

string_id!(
    /// Identifier of a replica: an independently operated copy of the archive.
    ReplicaId,
    "replica id"
);

/// The storage model of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaKind {
    /// Stores full file content; nodes execute batch jobs over local files.
    Bitarchive,
    /// Stores only filenames and checksums.
    Checksum,
}

impl Display for ReplicaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bitarchive => f.write_str("BITARCHIVE"),
            Self::Checksum => f.write_str("CHECKSUM"),
        }
    }
}

/// A replica as declared in configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub kind: ReplicaKind,
    pub name: String,
}

impl Replica {
    pub fn new(id: ReplicaId, kind: ReplicaKind, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
        }
    }
}

/// One physical storage process and the replica it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageNodeIdentity {
    pub node_id: NodeId,
    pub replica_id: ReplicaId,
}

impl StorageNodeIdentity {
    pub fn new(node_id: NodeId, replica_id: ReplicaId) -> Self {
        Self {
            node_id,
            replica_id,
        }
    }
}

impl Display for StorageNodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.node_id, self.replica_id)
    }
}

/// Correlation id of a batch round. Replies carry it back to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundId(Uuid);

impl RoundId {
    /// Generates a fresh random round id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RoundId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

// ============================================================================
// Temporal Types
// ============================================================================

/// Wall-clock time in milliseconds since the Unix epoch.
///
/// Heartbeats carry the sender's timestamp; liveness compares it against the
/// receiver's notion of `now`. Arithmetic saturates so a skewed clock never
/// underflows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Creates a timestamp for the current time.
    ///
    /// A clock set before the Unix epoch reads as [`Timestamp::EPOCH`].
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self(millis)
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ============================================================================
// Journal Ordering
// ============================================================================

/// Position of an entry in a checksum journal's append order.
///
/// Sequence numbers are assigned by the single journal writer and strictly
/// increase; they are the sole tie-break between entries for one filename.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the following sequence number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Checksums
// ============================================================================

/// Hex-encoded content digest of an archive file (SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Parses a checksum as it appears in journals and batch output.
    ///
    /// Accepts any non-empty lowercase hex string so that digests recorded by
    /// other replicas can be compared verbatim.
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidValue> {
        let value = value.into();
        check_token("checksum", &value)?;
        if !value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(InvalidValue::NotHex(value));
        }
        Ok(Self(value))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Computes the checksum of everything `reader` yields.
    pub fn of_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn of_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::of_reader(File::open(path)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Checksum {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.0
    }
}

// ============================================================================
// Filenames
// ============================================================================

/// Validates an archive filename.
///
/// Filenames are single path components: non-empty, free of whitespace and
/// path separators, and never containing [`FILENAME_CHECKSUM_SEPARATOR`],
/// because every persisted format is whitespace- or `##`-delimited.
pub fn validate_filename(filename: &str) -> Result<(), InvalidValue> {
    check_token("filename", filename)?;
    if filename.contains(FILENAME_CHECKSUM_SEPARATOR) {
        return Err(InvalidValue::Reserved {
            what: "filename",
            value: filename.to_string(),
            reserved: FILENAME_CHECKSUM_SEPARATOR,
        });
    }
    for reserved in ["/", "\\"] {
        if filename.contains(reserved) {
            return Err(InvalidValue::Reserved {
                what: "filename",
                value: filename.to_string(),
                reserved,
            });
        }
    }
    if filename == "." || filename == ".." {
        return Err(InvalidValue::Reserved {
            what: "filename",
            value: filename.to_string(),
            reserved: "..",
        });
    }
    Ok(())
}

/// Splits a `filename##checksum` line into its parts.
pub fn split_checksum_line(line: &str) -> Option<(&str, &str)> {
    let (name, sum) = line.split_once(FILENAME_CHECKSUM_SEPARATOR)?;
    if name.is_empty() || sum.is_empty() {
        return None;
    }
    Some((name, sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("TEST1.arc" ; "plain arc")]
    #[test_case("1-1-20260101-00001.warc.gz" ; "warc with dashes")]
    fn accepts_archive_filenames(name: &str) {
        assert!(validate_filename(name).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("two words.arc" ; "space")]
    #[test_case("ERROR!##abc" ; "separator")]
    #[test_case("dir/file.arc" ; "slash")]
    #[test_case(".." ; "parent")]
    fn rejects_bad_filenames(name: &str) {
        assert!(validate_filename(name).is_err());
    }

    #[test]
    fn checksum_of_known_input() {
        let c = Checksum::of_bytes(b"abc");
        assert_eq!(
            c.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(Checksum::of_reader(&b"abc"[..]).unwrap(), c);
    }

    #[test]
    fn checksum_parse_rejects_non_hex() {
        assert!(Checksum::parse("ABCDEF").is_err());
        assert!(Checksum::parse("").is_err());
        assert!(Checksum::parse("00ff").is_ok());
    }

    #[test]
    fn checksum_of_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.arc");
        std::fs::write(&path, b"archive body").unwrap();
        assert_eq!(
            Checksum::of_file(&path).unwrap(),
            Checksum::of_bytes(b"archive body")
        );
    }

    #[test]
    fn ids_reject_whitespace_and_roundtrip_serde() {
        assert!(NodeId::new("node 1").is_err());
        let id = ReplicaId::new("ONE").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ONE\"");
        let back: ReplicaId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<NodeId>("\"\"").is_err());
    }

    #[test]
    fn timestamp_elapsed_saturates() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(1_500);
        assert_eq!(b.saturating_duration_since(a), Duration::from_millis(500));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }

    #[test]
    fn split_checksum_line_requires_both_parts() {
        assert_eq!(split_checksum_line("a.arc##00ff"), Some(("a.arc", "00ff")));
        assert_eq!(split_checksum_line("a.arc##"), None);
        assert_eq!(split_checksum_line("a.arc"), None);
    }

    proptest::proptest! {
        #[test]
        fn sequence_numbers_strictly_increase(start in 0u64..u64::MAX - 1) {
            let s = SequenceNumber::new(start);
            proptest::prop_assert!(s.next() > s);
        }
    }
}
