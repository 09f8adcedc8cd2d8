//! syncbox CLI
//!
//! Command-line tools for syncbox databases.
//!
//! # Commands
//!
//! - `inspect` - Show outbox, metadata and sync state
//! - `requeue` - Rebuild or repair the outbox
//! - `purge` - Physically delete old tombstones
//! - `tables` - List, include or exclude tables from sync
//! - `decode` - Inspect a payload envelope file
//! - `sweep` - Remove stale staged assets
//! - `simulate` - Run two in-memory devices against each other

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// syncbox command-line tools.
#[derive(Parser)]
#[command(name = "syncbox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database file
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
    /// Show outbox, metadata and sync state
    Inspect {
        /// List every outbox entry
        #[arg(short, long)]
        entries: bool,

        /// List sync metadata rows
        #[arg(short, long)]
        metadata: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rebuild or repair the outbox
    Requeue {
        /// Only put in-flight entries back to pending
        #[arg(long)]
        in_flight: bool,

        /// Only drop entries superseded by a newer one
        #[arg(long)]
        prune: bool,

        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Physically delete tombstones older than the grace period
    Purge {
        /// Grace period in days
        #[arg(long, default_value = "30")]
        older_than_days: u64,

        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// List tables, or include and exclude them from sync
    Tables {
        /// Tables to include
        #[arg(long, value_delimiter = ',')]
        enable: Vec<String>,

        /// Tables to exclude
        #[arg(long, value_delimiter = ',')]
        disable: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Inspect a payload envelope file
    Decode {
        /// Envelope file
        file: PathBuf,

        /// Decode the body as a record of this table
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Remove stale staged assets
    Sweep {
        /// Staging directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Minimum age in hours
        #[arg(long, default_value = "24")]
        max_age_hours: u64,
    },

    /// Run two in-memory devices against an in-memory backend
    Simulate {
        /// Records to create on the first device
        #[arg(short, long, default_value = "250")]
        records: usize,

        /// Outbox entries per batch
        #[arg(short, long, default_value = "100")]
        batch_size: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            entries,
            metadata,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, entries, metadata, &format)?;
        }
        Commands::Requeue {
            in_flight,
            prune,
            dry_run,
        } => {
            let path = cli.path.ok_or("Database path required for requeue")?;
            let mode = match (in_flight, prune) {
                (true, true) => return Err("--in-flight and --prune are exclusive".into()),
                (true, false) => commands::requeue::Mode::InFlight,
                (false, true) => commands::requeue::Mode::Prune,
                (false, false) => commands::requeue::Mode::Rebuild,
            };
            commands::requeue::run(&path, mode, dry_run)?;
        }
        Commands::Purge {
            older_than_days,
            dry_run,
        } => {
            let path = cli.path.ok_or("Database path required for purge")?;
            commands::purge::run(&path, older_than_days, dry_run)?;
        }
        Commands::Tables {
            enable,
            disable,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for tables")?;
            commands::tables::run(&path, &enable, &disable, &format)?;
        }
        Commands::Decode { file, table } => {
            commands::decode::run(&file, table.as_deref())?;
        }
        Commands::Sweep { dir, max_age_hours } => {
            commands::sweep::run(dir.as_deref(), max_age_hours)?;
        }
        Commands::Simulate {
            records,
            batch_size,
            format,
        } => {
            commands::simulate::run(records, batch_size, &format)?;
        }
        Commands::Version => {
            println!("syncbox CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("envelope format v{}", syncbox_codec::FORMAT_VERSION);
        }
    }

    Ok(())
}
