//! `plexusd` - the Plexus plugin runtime daemon.
//!
//! On start the daemon reconciles the registry with the plugin directory,
//! loads every enabled plugin in dependency order, and then keeps three
//! background tasks running until Ctrl+C: the health monitor, the
//! filesystem watcher, and activity-log pruning.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plexus_config::Config;

mod bridge;
mod commands;

/// Plexus - dynamic plugin runtime
#[derive(Parser)]
#[command(name = "plexusd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "PLEXUS_CONFIG")]
    config: Option<PathBuf>,

    /// Plugin root directory, overriding `plugins.dir`
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,

    /// Log level, overriding `logging.level`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: pretty, compact, json or full
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the runtime until interrupted (default)
    Run,

    /// Print every registry record
    List {
        /// Reconcile with the plugin directory before listing
        #[arg(long)]
        sync: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let resolved = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let cfg = resolved.config;

    let log_config = bridge::to_log_config(&cfg, cli.log_level.as_deref(), cli.log_format.as_deref())
        .context("invalid logging configuration")?;
    if let Err(e) = plexus_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }
    for file in &resolved.loaded_files {
        tracing::debug!(file = %file, "Loaded config file");
    }

    let settings = bridge::to_runtime_settings(&cfg, cli.plugins_dir.as_deref());
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run(&cfg, settings).await,
        Commands::List { sync } => commands::list(&cfg, settings, sync).await,
    }
}
