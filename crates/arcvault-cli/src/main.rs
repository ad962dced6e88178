//! arcvault command line.
//!
//! Administers the checksum journal of a deployment and shows the layered
//! configuration it runs with.
//!
//! # Quick Start
//!
//! ```bash
//! # Record a file's checksum
//! arcvault journal upload ./capture-0001.arc
//!
//! # Look it up again
//! arcvault journal checksum capture-0001.arc
//!
//! # Show the effective configuration
//! arcvault config show --format toml
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// arcvault - replicated preservation archive.
#[derive(Parser)]
#[command(name = "arcvault")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Deployment directory holding arcvault.toml.
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Checksum journal administration.
    #[command(subcommand)]
    Journal(JournalCommands),

    /// Configuration management.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum JournalCommands {
    /// Record a file's checksum under its name.
    Upload {
        /// File to record.
        file: PathBuf,

        /// Archive filename (defaults to the file's own name).
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print the current checksum of a file.
    Checksum {
        /// Archive filename.
        filename: String,
    },

    /// Replace a file's checksum with that of a reference copy.
    Correct {
        /// Archive filename.
        filename: String,

        /// Trusted copy of the file.
        reference: PathBuf,
    },

    /// List current entries.
    List {
        /// Print `filename##checksum` instead of filenames.
        #[arg(long)]
        checksums: bool,
    },

    /// Show every journal entry for a file, in append order.
    History {
        /// Archive filename.
        filename: String,
    },

    /// List entries superseded by corrections.
    WrongEntries,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration.
    Show {
        /// Output format (text, toml, json).
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the configuration files.
    Validate,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let project = cli.project.as_path();

    match cli.command {
        Commands::Journal(cmd) => match cmd {
            JournalCommands::Upload { file, name } => {
                commands::journal::upload(project, &file, name.as_deref())
            }
            JournalCommands::Checksum { filename } => commands::journal::checksum(project, &filename),
            JournalCommands::Correct {
                filename,
                reference,
            } => commands::journal::correct(project, &filename, &reference),
            JournalCommands::List { checksums } => commands::journal::list(project, checksums),
            JournalCommands::History { filename } => commands::journal::history(project, &filename),
            JournalCommands::WrongEntries => commands::journal::wrong_entries(project),
        },
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show { format } => commands::config::show(project, &format),
            ConfigCommands::Validate => commands::config::validate(project),
        },
    }
}
