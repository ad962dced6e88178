//! Configuration management commands.

use anyhow::{Context, Result};
use arcvault::ArchiveConfig;
use arcvault_config::Paths;
use std::path::Path;

/// Show current configuration.
pub fn show(project: &Path, format: &str) -> Result<()> {
    let config =
        ArchiveConfig::load_from_dir(project).context("Failed to load configuration")?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{json}");
        }
        "toml" => {
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{toml_str}");
        }
        _ => {
            println!("arcvault Configuration");
            println!("======================\n");

            println!("Journal:");
            println!("  Data directory: {}", config.journal.data_dir.display());
            println!("  Upload retry limit: {}", config.journal.upload_retry_limit);
            println!("  Min space left: {}", config.journal.min_space_left);
            println!(
                "  Min space after write: {}",
                config.journal.min_space_required_after_write
            );
            println!(
                "  Record memory threshold: {}",
                config.journal.record_memory_threshold
            );
            println!();

            println!("Heartbeat:");
            println!("  Interval: {:?}", config.heartbeat.interval());
            println!("  Acceptable delay: {:?}", config.heartbeat.acceptable_delay());
            println!();

            println!("Batch:");
            println!("  Timeout: {:?}", config.batch.timeout());
            println!("  Max node failures: {}", config.batch.max_node_failures);
            println!("  Max exceptions: {}", config.batch.max_exceptions);
            println!("  Result directory: {}", config.batch.result_dir.display());
            println!();

            println!("Replicas:");
            if config.replicas.is_empty() {
                println!("  (none)");
            }
            for replica in &config.replicas {
                println!("  {} ({}): {}", replica.id, replica.kind, replica.name);
            }
            println!();

            println!("Node:");
            println!(
                "  Identity: {}",
                config
                    .node
                    .node_id
                    .as_ref()
                    .zip(config.node.replica_id.as_ref())
                    .map_or("None".to_string(), |(n, r)| format!("{n}@{r}"))
            );
            println!("  Data directory: {}", config.node.data_dir.display());
        }
    }

    Ok(())
}

/// Validate configuration files.
pub fn validate(project: &Path) -> Result<()> {
    println!("Validating configuration in {}...", project.display());

    if !Paths::project_config_file(project).exists() {
        println!("  No arcvault.toml found, checking defaults and overrides only");
    }

    match ArchiveConfig::load_from_dir(project) {
        Ok(_) => {
            println!("✓ Configuration is valid");
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed:");
            println!("  {e:#}");
            Err(e)
        }
    }
}
