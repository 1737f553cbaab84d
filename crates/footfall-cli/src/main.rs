//! Footfall command line tool.
//!
//! # Quick Start
//!
//! ```bash
//! # Show the resolved configuration
//! footfall config
//!
//! # Replay a JSON-lines request log through the tracker
//! footfall replay requests.jsonl
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Footfall - privacy-preserving analytics ingestion.
#[derive(Parser)]
#[command(name = "footfall")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines request log through an in-memory tracker.
    Replay {
        /// File with one request per line.
        file: PathBuf,

        /// Directory containing footfall.toml (defaults to the current one).
        #[arg(long)]
        project_dir: Option<PathBuf>,

        /// Print every collapsed session as a JSON line.
        #[arg(long)]
        sessions: bool,
    },

    /// Print the resolved configuration as TOML.
    Config {
        /// Directory containing footfall.toml (defaults to the current one).
        #[arg(long)]
        project_dir: Option<PathBuf>,
    },
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

    match cli.command {
        Commands::Replay {
            file,
            project_dir,
            sessions,
        } => commands::replay::run(&file, project_dir.as_deref(), sessions),
        Commands::Config { project_dir } => commands::config::show(project_dir.as_deref()),
    }
}
