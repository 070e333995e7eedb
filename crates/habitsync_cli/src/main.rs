//! habitsync CLI
//!
//! Maintenance tools for habitsync store directories.
//!
//! # Commands
//!
//! - `inspect` - Display table, queue and log statistics
//! - `verify` - Check every log record's framing and checksum
//! - `dump-log` - Print log records for debugging
//! - `compact` - Rewrite the log as a single snapshot
//! - `queue` - List sync queue items or revive dead letters
//! - `migrate` - Show or apply schema migrations

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// habitsync command-line store tools.
#[derive(Parser)]
#[command(name = "habitsync")]
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
    /// Display table, queue and log statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every log record's framing and checksum
    Verify,

    /// Print log records for debugging
    DumpLog {
        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rewrite the log as a single snapshot
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Inspect or repair the sync queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show or apply schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queue items
    List {
        /// Only show dead-lettered items
        #[arg(short, long)]
        failed: bool,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Put every dead-lettered item back into circulation
    RetryFailed,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Show applied and pending migrations
    Status,

    /// Apply pending migrations
    Run,
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
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::DumpLog { limit, format } => {
            let path = cli.path.ok_or("Store path required for dump-log")?;
            commands::dump_log::run(&path, limit, &format)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Queue { action } => {
            let path = cli.path.ok_or("Store path required for queue")?;
            match action {
                QueueAction::List { failed, format } => {
                    commands::queue::list(&path, failed, &format)?;
                }
                QueueAction::RetryFailed => commands::queue::retry_failed(&path)?,
            }
        }
        Commands::Migrate { action } => {
            let path = cli.path.ok_or("Store path required for migrate")?;
            match action {
                MigrateAction::Status => commands::migrate::status(&path)?,
                MigrateAction::Run => commands::migrate::run(&path)?,
            }
        }
        Commands::Version => {
            println!("habitsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Log format v{}, schema v{}",
                habitsync_store::LOG_VERSION,
                habitsync_store::LATEST_SCHEMA_VERSION
            );
        }
    }

    Ok(())
}
