//! `run` and `list`.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use plexus_config::{Config, StorageBackend};
use plexus_plugins::{
    HealthMonitor, InMemoryHost, PluginRecord, PluginRuntime, PluginState, PluginWatcher,
    RuntimeSettings, StandardResolver, SysinfoSampler, spawn_watch_dispatcher,
};
use plexus_storage::{DocumentStore, FileDocumentStore, MemoryDocumentStore};
use tracing::{info, warn};

use crate::bridge;

/// Aborts a background task when dropped.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn open_store(cfg: &Config) -> Result<Arc<dyn DocumentStore>> {
    Ok(match cfg.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryDocumentStore::new()),
        StorageBackend::File => Arc::new(
            FileDocumentStore::open(&cfg.storage.path).with_context(|| {
                format!("failed to open store at {}", cfg.storage.path.display())
            })?,
        ),
    })
}

fn build_runtime(cfg: &Config, settings: RuntimeSettings) -> Result<Arc<PluginRuntime>> {
    let store = open_store(cfg)?;
    Ok(PluginRuntime::new(
        settings,
        store,
        Arc::new(InMemoryHost::new()),
        Arc::new(StandardResolver::new()),
    ))
}

/// Start the runtime and block until Ctrl+C.
pub(crate) async fn run(cfg: &Config, settings: RuntimeSettings) -> Result<()> {
    std::fs::create_dir_all(&settings.plugins_dir).with_context(|| {
        format!(
            "failed to create plugin directory {}",
            settings.plugins_dir.display()
        )
    })?;
    let watcher_config = bridge::to_watcher_config(cfg, &settings);
    let runtime = build_runtime(cfg, settings)?;

    let sync = runtime
        .registry()
        .sync_with_filesystem()
        .await
        .context("initial registry sync failed")?;
    info!(
        discovered = sync.discovered.len(),
        missing = sync.missing.len(),
        restored = sync.restored.len(),
        skipped = sync.skipped.len(),
        "Registry synchronized"
    );

    let report = runtime
        .load_all_enabled()
        .await
        .context("failed to read registry for startup load")?;
    println!(
        "{}",
        format!(
            "plexusd: {} loaded, {} failed, {} unresolved",
            report.loaded.len(),
            report.failed.len(),
            report.unresolved.len()
        )
        .cyan()
        .bold()
    );
    for failed in &report.failed {
        println!("  {} {}: {}", "failed".red(), failed.name, failed.error);
    }
    for unresolved in &report.unresolved {
        println!("  {} {}: {}", "unresolved".yellow(), unresolved.name, unresolved.reason);
    }

    let mut tasks = vec![AbortOnDrop(
        HealthMonitor::new(Arc::clone(&runtime), Arc::new(SysinfoSampler::new())).spawn(),
    )];
    tasks.push(AbortOnDrop(spawn_prune_loop(
        Arc::clone(&runtime),
        Duration::from_secs(cfg.activity.prune_interval_secs),
    )));
    if cfg.watcher.enabled {
        match PluginWatcher::new(watcher_config) {
            Ok((watcher, events)) => {
                tasks.push(AbortOnDrop(spawn_watch_dispatcher(
                    Arc::clone(&runtime),
                    watcher,
                    events,
                )));
            },
            Err(e) => warn!(error = %e, "Hot reload disabled, watcher failed to start"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    println!("\n{}", "Shutting down...".yellow());

    drop(tasks);
    runtime.shutdown().await;

    println!("{}", "plexusd stopped".green().bold());
    Ok(())
}

fn spawn_prune_loop(runtime: Arc<PluginRuntime>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match runtime.activity().prune_expired(chrono::Utc::now()).await {
                Ok(0) => {},
                Ok(removed) => info!(removed, "Pruned expired activity records"),
                Err(e) => warn!(error = %e, "Activity prune failed"),
            }
        }
    })
}

/// Print the registry.
pub(crate) async fn list(cfg: &Config, settings: RuntimeSettings, sync: bool) -> Result<()> {
    let runtime = build_runtime(cfg, settings)?;
    if sync {
        runtime
            .registry()
            .sync_with_filesystem()
            .await
            .context("registry sync failed")?;
    }

    let records = runtime
        .registry()
        .list()
        .await
        .context("failed to read registry")?;
    if records.is_empty() {
        println!("{}", "No plugins registered".dimmed());
        return Ok(());
    }
    for record in &records {
        println!("{}", format_record(record));
    }
    Ok(())
}

fn format_record(record: &PluginRecord) -> String {
    let state = record.state.to_string();
    let state = match record.state {
        PluginState::Active => state.green(),
        PluginState::Failed => state.red(),
        PluginState::Maintenance | PluginState::Loading => state.yellow(),
        _ => state.normal(),
    };
    let enabled = if record.enabled { "enabled" } else { "disabled" };
    let deps: Vec<&str> = record.dependencies.iter().map(|d| d.name.as_str()).collect();
    let mut line = format!(
        "{:<24} {:<10} {:<12} {:<9} errors={}",
        record.name.as_str().bold(),
        record.version,
        state,
        enabled,
        record.error_count
    );
    if !deps.is_empty() {
        let _ = write!(line, " deps={}", deps.join(","));
    }
    line
}
