//! Checksum journal commands.

use anyhow::{Context, Result};
use arcvault::{ArchiveConfig, ArchiveContext, FILENAME_CHECKSUM_SEPARATOR, LocalBus, RemoteFile};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Opens the deployment's journal. No coordinator loop runs for these
/// commands, so the bus receiver is dropped.
fn open(project: &Path) -> Result<ArchiveContext> {
    let config =
        ArchiveConfig::load_from_dir(project).context("Failed to load configuration")?;
    let (bus, _inbox) = LocalBus::new();
    ArchiveContext::open(config, Arc::new(bus)).context("Failed to open checksum journal")
}

fn print_remote(file: RemoteFile) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    file.append_to(&mut out)?;
    out.flush()?;
    Ok(())
}

/// Record a file's checksum.
pub fn upload(project: &Path, file: &Path, name: Option<&str>) -> Result<()> {
    let filename = match name {
        Some(name) => name.to_string(),
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("Cannot derive a filename from {}", file.display()))?,
    };

    let ctx = open(project)?;
    let entry = ctx
        .upload(file, &filename)
        .with_context(|| format!("Failed to upload {filename}"))?;
    println!("{}{FILENAME_CHECKSUM_SEPARATOR}{}", entry.filename, entry.checksum);
    Ok(())
}

/// Print the current checksum of a file.
pub fn checksum(project: &Path, filename: &str) -> Result<()> {
    let ctx = open(project)?;
    let checksum = ctx.journal().get_checksum(filename)?;
    println!("{checksum}");
    Ok(())
}

/// Replace a file's checksum with that of a reference copy.
pub fn correct(project: &Path, filename: &str, reference: &Path) -> Result<()> {
    let ctx = open(project)?;
    let outcome = ctx
        .correct(filename, reference)
        .with_context(|| format!("Failed to correct {filename}"))?;

    match outcome.superseded {
        Some(old) => println!(
            "Corrected {filename}: {} -> {}",
            old.checksum, outcome.current.checksum
        ),
        None => println!("{filename} already matches the reference"),
    }
    Ok(())
}

/// List current entries.
pub fn list(project: &Path, checksums: bool) -> Result<()> {
    let ctx = open(project)?;
    let listing = if checksums {
        ctx.journal().list_all_checksums()?
    } else {
        ctx.journal().list_all_filenames()?
    };
    print_remote(listing)
}

/// Show every entry for a file.
pub fn history(project: &Path, filename: &str) -> Result<()> {
    let ctx = open(project)?;
    let entries = ctx.journal().history(filename)?;
    if entries.is_empty() {
        anyhow::bail!("No journal entries for {filename}");
    }
    for entry in entries {
        println!("{}", entry.to_line());
    }
    Ok(())
}

/// List entries superseded by corrections.
pub fn wrong_entries(project: &Path) -> Result<()> {
    let ctx = open(project)?;
    print_remote(ctx.journal().list_wrong_entries()?)
}
