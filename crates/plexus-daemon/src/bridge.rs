//! Bridge from `plexus_config::Config` to runtime types.
//!
//! The config crate has no dependency on the runtime; conversion happens
//! here, once, so the rest of the daemon only sees domain types.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use plexus_config::Config;
use plexus_plugins::{HealthThresholds, RuntimeSettings, WatcherConfig};
use plexus_telemetry::{LogConfig, LogFormat, TelemetryResult};

/// Convert config to [`RuntimeSettings`].
///
/// `plugins_dir` overrides `plugins.dir` when given.
#[must_use]
pub(crate) fn to_runtime_settings(cfg: &Config, plugins_dir: Option<&Path>) -> RuntimeSettings {
    RuntimeSettings {
        plugins_dir: plugins_dir.map_or_else(|| cfg.plugins.dir.clone(), Path::to_path_buf),
        shared_dir: cfg.plugins.shared_dir.clone(),
        enable_on_discovery: cfg.plugins.enable_on_discovery,
        core_collections: cfg.plugins.core_collections.clone(),
        entry_timeout: Duration::from_secs(cfg.loader.entry_timeout_secs),
        cleanup_timeout: Duration::from_secs(cfg.loader.cleanup_timeout_secs),
        thresholds: HealthThresholds {
            warning_memory_mb: cfg.health.warning_memory_mb,
            critical_memory_mb: cfg.health.critical_memory_mb,
            warning_cpu_percent: cfg.health.warning_cpu_percent,
            critical_cpu_percent: cfg.health.critical_cpu_percent,
            reload_memory_mb: cfg.health.reload_memory_mb,
        },
        health_interval: Duration::from_secs(cfg.health.interval_secs),
        health_check_timeout: Duration::from_secs(cfg.health.check_timeout_secs),
        activity_retention_days: cfg.activity.retention_days,
    }
}

/// Convert config to a [`WatcherConfig`] rooted at the runtime's plugin
/// directory.
#[must_use]
pub(crate) fn to_watcher_config(cfg: &Config, settings: &RuntimeSettings) -> WatcherConfig {
    WatcherConfig {
        root: settings.plugins_dir.clone(),
        debounce: Duration::from_millis(cfg.watcher.debounce_ms),
    }
}

/// Convert config to a [`LogConfig`], with command-line overrides.
///
/// # Errors
///
/// Returns an error if the format name is unknown.
pub(crate) fn to_log_config(
    cfg: &Config,
    level: Option<&str>,
    format: Option<&str>,
) -> TelemetryResult<LogConfig> {
    let format = LogFormat::from_str(format.unwrap_or(&cfg.logging.format))?;
    Ok(LogConfig::new(level.unwrap_or(&cfg.logging.level))
        .with_format(format)
        .with_directives(cfg.logging.directives.iter().cloned()))
}
