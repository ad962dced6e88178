//! Per-replica listings parsed from batch job output.

use std::collections::{BTreeMap, BTreeSet};

use arcvault_types::{Checksum, ReplicaId, split_checksum_line};

/// Filenames a replica reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListing {
    pub replica: ReplicaId,
    /// Every expected node answered. An incomplete listing cannot prove a
    /// file is missing.
    pub complete: bool,
    pub filenames: BTreeSet<String>,
}

impl FileListing {
    /// Parses one-filename-per-line output.
    pub fn parse(replica: ReplicaId, complete: bool, output: &str) -> Self {
        let filenames = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            replica,
            complete,
            filenames,
        }
    }
}

/// Checksums a replica reported. A replica with several copies of a file
/// (one per node) may report several checksums for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumListing {
    pub replica: ReplicaId,
    pub complete: bool,
    pub checksums: BTreeMap<String, BTreeSet<Checksum>>,
    /// Lines that were not `filename##checksum`.
    pub malformed_lines: usize,
}

impl ChecksumListing {
    /// Parses `filename##checksum` output, skipping malformed lines.
    pub fn parse(replica: ReplicaId, complete: bool, output: &str) -> Self {
        let mut checksums: BTreeMap<String, BTreeSet<Checksum>> = BTreeMap::new();
        let mut malformed_lines = 0;
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let parsed = split_checksum_line(line)
                .and_then(|(name, sum)| Checksum::parse(sum).ok().map(|c| (name, c)));
            match parsed {
                Some((name, checksum)) => {
                    checksums.entry(name.to_string()).or_default().insert(checksum);
                }
                None => {
                    tracing::warn!(replica = %replica, line, "malformed checksum line");
                    malformed_lines += 1;
                }
            }
        }
        Self {
            replica,
            complete,
            checksums,
            malformed_lines,
        }
    }

    /// The checksum every copy in this replica agrees on, if they agree.
    pub fn unique(&self, filename: &str) -> Option<&Checksum> {
        let sums = self.checksums.get(filename)?;
        if sums.len() == 1 {
            sums.iter().next()
        } else {
            None
        }
    }
}
