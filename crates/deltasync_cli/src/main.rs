//! DeltaSync CLI
//!
//! Command-line tools for inspecting and repairing a DeltaSync store.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and device watermarks
//! - `dump-log` - Dump local deltas for debugging
//! - `prune` - Remove deltas past the retention period
//! - `queue` - List or clear the offline delivery queue
//! - `conflicts` - Show the conflict history
//! - `reset` - Clear version state to force a full sync

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// DeltaSync command-line store tools.
#[derive(Parser)]
#[command(name = "deltasync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and device watermarks
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump local deltas for debugging
    DumpLog {
        /// Only deltas with a version above this one
        #[arg(short, long, default_value = "0")]
        since: u64,

        /// Maximum number of deltas to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only deltas for this entity kind (emoji, group, settings, favorites)
        #[arg(short, long)]
        kind: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove deltas past the retention period
    Prune {
        /// Retention in days
        #[arg(short, long, default_value = "30")]
        older_than_days: u64,

        /// Dry run - show what would be removed
        #[arg(short, long)]
        dry_run: bool,
    },

    /// List or clear the offline delivery queue
    Queue {
        /// Discard every queued delta
        #[arg(long)]
        clear: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the conflict history
    Conflicts {
        /// Only conflicts awaiting manual resolution
        #[arg(short, long)]
        unresolved: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Clear version state so the next sync is a full reconciliation
    Reset {
        /// Only reset this device (defaults to every device)
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpLog {
            since,
            limit,
            kind,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-log")?;
            commands::dump_log::run(&path, since, limit, kind.as_deref(), &format)?;
        }
        Commands::Prune {
            older_than_days,
            dry_run,
        } => {
            let path = cli.path.ok_or("Store path required for prune")?;
            commands::prune::run(&path, older_than_days, dry_run)?;
        }
        Commands::Queue { clear, format } => {
            let path = cli.path.ok_or("Store path required for queue")?;
            commands::queue::run(&path, clear, &format)?;
        }
        Commands::Conflicts { unresolved, format } => {
            let path = cli.path.ok_or("Store path required for conflicts")?;
            commands::conflicts::run(&path, unresolved, &format)?;
        }
        Commands::Reset { device } => {
            let path = cli.path.ok_or("Store path required for reset")?;
            commands::reset::run(&path, device.as_deref())?;
        }
        Commands::Version => {
            println!("DeltaSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
