//! Configuration management for arcvault
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (ARCV_* prefix, `__` between section and key)
//! 2. arcvault.local.toml (gitignored, local overrides)
//! 3. arcvault.toml (git-tracked, deployment config)
//! 4. ~/.config/arcvault/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use arcvault_types::{NodeId, Replica, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

const MIB: u64 = 1024 * 1024;

/// Main arcvault configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub journal: JournalConfig,
    pub heartbeat: HeartbeatConfig,
    pub batch: BatchConfig,
    pub replicas: Vec<Replica>,
    pub node: NodeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub data_dir: PathBuf,
    /// Attempts per upload before giving up.
    pub upload_retry_limit: u32,
    pub min_space_left: u64,
    pub min_space_required_after_write: u64,
    /// Records at most this long are returned in memory.
    pub record_memory_threshold: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".arcvault/journal"),
            upload_retry_limit: 3,
            min_space_left: 100 * MIB,
            min_space_required_after_write: 10 * MIB,
            record_memory_threshold: MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub acceptable_delay_ms: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn acceptable_delay(&self) -> Duration {
        Duration::from_millis(self.acceptable_delay_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            acceptable_delay_ms: 180_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub timeout_ms: u64,
    pub max_node_failures: usize,
    /// Per-node cap on recorded exceptions.
    pub max_exceptions: usize,
    pub result_dir: PathBuf,
}

impl BatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 7 * 24 * 60 * 60 * 1000,
            max_node_failures: 0,
            max_exceptions: 100,
            result_dir: PathBuf::from(".arcvault/results"),
        }
    }
}

/// Identity of this process when it runs as a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: Option<NodeId>,
    pub replica_id: Option<ReplicaId>,
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            replica_id: None,
            data_dir: PathBuf::from(".arcvault/node"),
        }
    }
}

impl ArchiveConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific deployment directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file, without layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn replica(&self, id: &ReplicaId) -> Option<&Replica> {
        self.replicas.iter().find(|r| &r.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.heartbeat.interval_ms == 0 {
            return invalid("heartbeat.interval_ms must be positive".to_string());
        }
        if self.heartbeat.acceptable_delay_ms <= self.heartbeat.interval_ms {
            return invalid(format!(
                "heartbeat.acceptable_delay_ms ({}) must exceed heartbeat.interval_ms ({})",
                self.heartbeat.acceptable_delay_ms, self.heartbeat.interval_ms
            ));
        }
        if self.journal.upload_retry_limit == 0 {
            return invalid("journal.upload_retry_limit must be at least 1".to_string());
        }
        if self.batch.timeout_ms == 0 {
            return invalid("batch.timeout_ms must be positive".to_string());
        }

        let mut seen = BTreeSet::new();
        for replica in &self.replicas {
            if !seen.insert(&replica.id) {
                return invalid(format!("replica {} is declared twice", replica.id));
            }
        }

        if let Some(replica) = &self.node.replica_id
            && !self.replicas.is_empty()
            && self.replica(replica).is_none()
        {
            return invalid(format!("node.replica_id {replica} is not a declared replica"));
        }
        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        for dir in [
            &mut self.journal.data_dir,
            &mut self.batch.result_dir,
            &mut self.node.data_dir,
        ] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
}
