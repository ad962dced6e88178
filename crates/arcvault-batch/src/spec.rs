//! Serializable description of a batch job.
//!
//! A [`BatchJobSpec`] is what travels over the message bus: the kind of job
//! to instantiate on each node, the filename selection, and an optional
//! timeout override. Nodes turn it into a runnable [`BatchJob`](crate::BatchJob)
//! through a [`JobRegistry`](crate::JobRegistry).

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{BatchError, Result};

/// Pattern selecting every file.
pub const EVERYTHING_PATTERN: &str = ".*";

/// The job a node should instantiate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Emits one filename per line.
    FileList,
    /// Emits one `filename##checksum` line per file.
    Checksum,
    /// A job registered by name on the nodes, with free-form arguments.
    Custom {
        name: String,
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
}

/// A unit of batch work: which job, which files, how long to wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobSpec {
    pub kind: JobKind,
    filename_pattern: String,
    timeout_ms: Option<u64>,
}

impl BatchJobSpec {
    /// Creates a spec that processes every file.
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            filename_pattern: EVERYTHING_PATTERN.to_string(),
            timeout_ms: None,
        }
    }

    pub fn file_list() -> Self {
        Self::new(JobKind::FileList)
    }

    pub fn checksum() -> Self {
        Self::new(JobKind::Checksum)
    }

    /// Restricts the job to files whose whole name matches `pattern`.
    pub fn process_only_files_matching(mut self, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(BatchError::InvalidArgument(
                "filename pattern must not be empty".to_string(),
            ));
        }
        compile_anchored(&pattern)?;
        self.filename_pattern = pattern;
        Ok(self)
    }

    /// Restricts the job to files matching any of `patterns`.
    pub fn process_only_files_matching_any<I, S>(self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = patterns
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("|");
        if joined.is_empty() {
            return Err(BatchError::InvalidArgument(
                "at least one filename pattern is required".to_string(),
            ));
        }
        self.process_only_files_matching(format!("({joined})"))
    }

    /// Restricts the job to exactly one filename.
    pub fn process_only_file_named(self, filename: &str) -> Result<Self> {
        if filename.is_empty() {
            return Err(BatchError::InvalidArgument(
                "filename must not be empty".to_string(),
            ));
        }
        self.process_only_files_matching(regex::escape(filename))
    }

    /// Restricts the job to the given filenames. An empty list selects nothing.
    pub fn process_only_files_named<I, S>(self, filenames: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let quoted: Vec<String> = filenames
            .into_iter()
            .map(|f| regex::escape(f.as_ref()))
            .collect();
        if quoted.is_empty() {
            // Matches no filename: filenames are never empty.
            return self.process_only_files_matching("^$");
        }
        self.process_only_files_matching_any(quoted)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn filename_pattern(&self) -> &str {
        &self.filename_pattern
    }

    /// The job's own timeout, or `default` when none (or zero) was set.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        match self.timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => default,
        }
    }

    /// Compiles the filename selection.
    pub fn filter(&self) -> Result<FilenameFilter> {
        Ok(FilenameFilter {
            regex: compile_anchored(&self.filename_pattern)?,
        })
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| BatchError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Compiled filename selection. Matches whole filenames only.
#[derive(Debug, Clone)]
pub struct FilenameFilter {
    regex: Regex,
}

impl FilenameFilter {
    pub fn matches(&self, filename: &str) -> bool {
        self.regex.is_match(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn default_spec_matches_everything() {
        let filter = BatchJobSpec::file_list().filter().unwrap();
        assert!(filter.matches("a.arc"));
        assert!(filter.matches("anything-at-all.warc.gz"));
    }

    #[test_case("a.arc", true ; "exact name")]
    #[test_case("xa.arc", false ; "prefix is not a match")]
    #[test_case("a.arc.gz", false ; "suffix is not a match")]
    #[test_case("aXarc", false ; "dot is literal")]
    fn single_filename_is_quoted(candidate: &str, expected: bool) {
        let filter = BatchJobSpec::checksum()
            .process_only_file_named("a.arc")
            .unwrap()
            .filter()
            .unwrap();
        assert_eq!(filter.matches(candidate), expected);
    }

    #[test]
    fn several_names_are_or_joined() {
        let filter = BatchJobSpec::checksum()
            .process_only_files_named(["a.arc", "b.arc"])
            .unwrap()
            .filter()
            .unwrap();
        assert!(filter.matches("a.arc"));
        assert!(filter.matches("b.arc"));
        assert!(!filter.matches("c.arc"));
    }

    #[test]
    fn empty_name_list_selects_nothing() {
        let filter = BatchJobSpec::checksum()
            .process_only_files_named(Vec::<String>::new())
            .unwrap()
            .filter()
            .unwrap();
        assert!(!filter.matches("a.arc"));
    }

    #[test]
    fn bad_pattern_is_rejected_up_front() {
        let err = BatchJobSpec::file_list()
            .process_only_files_matching("(unclosed")
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidPattern { .. }));
    }

    #[test]
    fn timeout_override_falls_back_to_default() {
        let default = Duration::from_secs(30);
        assert_eq!(BatchJobSpec::file_list().timeout_or(default), default);
        let spec = BatchJobSpec::file_list().with_timeout(Duration::from_secs(5));
        assert_eq!(spec.timeout_or(default), Duration::from_secs(5));
        let zero = BatchJobSpec::file_list().with_timeout(Duration::ZERO);
        assert_eq!(zero.timeout_or(default), default);
    }

    #[test]
    fn spec_serializes_with_kind_tag() {
        let spec = BatchJobSpec::checksum();
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"checksum\""));
        let back: BatchJobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
