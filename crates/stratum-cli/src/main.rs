//! Stratum migration runner
//!
//! Applies, rolls back and reports on the shop database's migrations.

mod commands;
mod formatter;
mod migrations;

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use formatter::OutputFormat;
use stratum_core::{CancellationToken, EXIT_FAILURE};
use tracing_subscriber::EnvFilter;

/// Stratum migration runner
#[derive(Parser, Debug)]
#[command(name = "migrate")]
#[command(version, about = "Schema evolution and backfill runner")]
pub struct Args {
    /// Path to the SQLite database file
    #[arg(short = 'd', long, env = "STRATUM_DATABASE")]
    pub database: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Runner commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply every pending migration, or up through one
    Up(UpArgs),
    /// Roll back applied migrations (one step by default)
    Down(DownArgs),
    /// Show every known migration and whether it is applied
    Status,
    /// Force-release a run-lock left behind by a crashed process
    Unlock,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct UpArgs {
    /// Stop after applying this migration
    #[arg(long)]
    pub to: Option<String>,

    /// Report what would be applied without touching the database
    #[arg(long)]
    pub dry_run: bool,

    /// Permit migrations that remove columns
    #[arg(long)]
    pub allow_destructive: bool,

    /// Rows per backfill chunk when a migration does not set its own
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Seconds to wait for the run-lock
    #[arg(long, default_value_t = 30)]
    pub lock_timeout: u64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DownArgs {
    /// Roll back everything applied since this migration, including it
    #[arg(long, conflicts_with = "steps")]
    pub to: Option<String>,

    /// Number of migrations to roll back
    #[arg(long)]
    pub steps: Option<usize>,

    /// Permit rollbacks that discard data
    #[arg(long)]
    pub accept_data_loss: bool,

    /// Report what would be rolled back without touching the database
    #[arg(long)]
    pub dry_run: bool,

    /// Seconds to wait for the run-lock
    #[arg(long, default_value_t = 30)]
    pub lock_timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stratum=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let format = args.format;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next chunk boundary");
            on_interrupt.cancel();
        }
    });

    // The connection is not Sync, so the whole run stays on one blocking thread.
    let result = tokio::task::spawn_blocking(move || commands::execute(args, cancel)).await;

    match result {
        Ok(Ok(output)) => println!("{}", output),
        Ok(Err(e)) => {
            let formatter = formatter::create_formatter(format);
            eprintln!("{}", formatter.format_error(&e));
            std::process::exit(e.exit_code());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_FAILURE);
        }
    }
}
