//! Configuration loader with multi-source merging

use crate::{ArchiveConfig, Paths};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    env_source: Option<HashMap<String, String>>,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "ARCV".to_string(),
            env_source: None,
            include_user_config: true,
        }
    }

    /// Set the deployment directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "ARCV")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read environment overrides from `vars` instead of the process environment.
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    /// Skip ~/.config/arcvault/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence, then validate it
    pub fn load(self) -> Result<ArchiveConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = ArchiveConfig::default();
        builder = builder.add_source(
            config::Config::try_from(&defaults).context("Failed to serialize defaults")?,
        );

        // 2. User config (~/.config/arcvault/config.toml)
        if self.include_user_config
            && let Ok(user_config_file) = Paths::new().user_config_file()
            && user_config_file.exists()
        {
            builder = builder.add_source(
                config::File::from(user_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Deployment config, then 4. local overrides
        for file in [
            Paths::project_config_file(&self.project_dir),
            Paths::local_config_file(&self.project_dir),
        ] {
            if file.exists() {
                builder = builder.add_source(
                    config::File::from(file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 5. Environment variables (ARCV_SECTION__KEY)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(self.env_source.clone()),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut archive_config: ArchiveConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        archive_config.resolve_paths(&self.project_dir);
        archive_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(archive_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcvault_types::{ReplicaId, ReplicaKind};
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .without_user_config()
            .with_env_source(HashMap::new())
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.journal.upload_retry_limit, 3);
        assert_eq!(config.heartbeat.acceptable_delay_ms, 180_000);
        assert!(config.journal.data_dir.is_absolute());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[journal]
upload_retry_limit = 5

[batch]
max_node_failures = 1

[[replicas]]
id = "BA1"
kind = "BITARCHIVE"
name = "primary bitarchive"

[[replicas]]
id = "CS"
kind = "CHECKSUM"
name = "checksum archive"

[node]
node_id = "node-7"
replica_id = "BA1"
"#;
        fs::write(project_dir.join("arcvault.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.journal.upload_retry_limit, 5);
        assert_eq!(config.batch.max_node_failures, 1);
        assert_eq!(config.replicas.len(), 2);
        assert_eq!(config.replicas[1].kind, ReplicaKind::Checksum);
        assert_eq!(config.node.replica_id, Some(ReplicaId::new("BA1").unwrap()));
    }

    #[test]
    fn test_local_and_env_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("arcvault.toml"),
            "[heartbeat]\ninterval_ms = 1000\nacceptable_delay_ms = 5000\n",
        )
        .expect("Failed to write project config");
        fs::write(
            project_dir.join("arcvault.local.toml"),
            "[heartbeat]\ninterval_ms = 2000\n",
        )
        .expect("Failed to write local config");

        let env = HashMap::from([(
            "ARCV_HEARTBEAT__ACCEPTABLE_DELAY_MS".to_string(),
            "9000".to_string(),
        )]);
        let config = loader(project_dir)
            .with_env_source(env)
            .load()
            .expect("Failed to load config");

        assert_eq!(config.heartbeat.interval_ms, 2000);
        assert_eq!(config.heartbeat.acceptable_delay_ms, 9000);
    }

    #[test]
    fn test_invalid_layering_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join("arcvault.toml"),
            "[heartbeat]\ninterval_ms = 5000\nacceptable_delay_ms = 5000\n",
        )
        .expect("Failed to write config");

        let err = loader(temp_dir.path()).load().unwrap_err();
        assert!(format!("{err:#}").contains("acceptable_delay_ms"));
    }
}
