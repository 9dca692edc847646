//! Configuration struct definitions.
//!
//! Every section is `#[serde(default)]`, so a config file only needs to name
//! the fields it changes. The `Default` impls mirror `defaults.toml`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the plugin runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin directories and sandbox inputs.
    pub plugins: PluginsSection,
    /// Entry-point timeouts.
    pub loader: LoaderSection,
    /// Health monitor interval and thresholds.
    pub health: HealthSection,
    /// Filesystem watcher settings.
    pub watcher: WatcherSection,
    /// Activity log retention.
    pub activity: ActivitySection,
    /// Persistence backend.
    pub storage: StorageSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Where plugins live and what they may share.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Root directory; each subdirectory is one plugin.
    pub dir: PathBuf,
    /// Shared uploads directory reachable with `read_shared`/`write_shared`.
    pub shared_dir: PathBuf,
    /// Whether newly discovered plugins start enabled when their manifest
    /// does not say otherwise.
    pub enable_on_discovery: bool,
    /// Data-store collections treated as "core" by the sandbox.
    pub core_collections: Vec<String>,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("plugins"),
            shared_dir: PathBuf::from("uploads"),
            enable_on_discovery: true,
            core_collections: ["users", "settings", "pages", "media"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoaderSection
// ---------------------------------------------------------------------------

/// Bounds on plugin-supplied code during load and unload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSection {
    /// Upper bound for instantiating and registering a plugin.
    pub entry_timeout_secs: u64,
    /// Upper bound for a plugin's cleanup hook.
    pub cleanup_timeout_secs: u64,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            entry_timeout_secs: 30,
            cleanup_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// HealthSection
// ---------------------------------------------------------------------------

/// Health monitor cadence and thresholds. Memory is in megabytes, CPU in
/// percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Upper bound for a single plugin health check.
    pub check_timeout_secs: u64,
    /// Memory above which a plugin is reported as `warning`.
    pub warning_memory_mb: f64,
    /// Memory above which a plugin is reported as `critical`.
    pub critical_memory_mb: f64,
    /// CPU above which a plugin is reported as `warning`.
    pub warning_cpu_percent: f64,
    /// CPU above which a plugin is reported as `critical`.
    pub critical_cpu_percent: f64,
    /// Memory above which the monitor reloads the plugin.
    pub reload_memory_mb: f64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            check_timeout_secs: 5,
            warning_memory_mb: 200.0,
            critical_memory_mb: 500.0,
            warning_cpu_percent: 50.0,
            critical_cpu_percent: 80.0,
            reload_memory_mb: 1000.0,
        }
    }
}

// ---------------------------------------------------------------------------
// WatcherSection
// ---------------------------------------------------------------------------

/// Hot-reload watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    /// Whether the daemon watches the plugin directory at all.
    pub enabled: bool,
    /// Quiet period before a burst of file changes triggers a reload.
    pub debounce_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// ActivitySection
// ---------------------------------------------------------------------------

/// Activity log retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitySection {
    /// Days an activity record is kept before pruning.
    pub retention_days: u32,
    /// Seconds between prune runs.
    pub prune_interval_secs: u64,
}

impl Default for ActivitySection {
    fn default() -> Self {
        Self {
            retention_days: 90,
            prune_interval_secs: 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// StorageSection
// ---------------------------------------------------------------------------

/// Which document store backs the registry and activity log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON-lines collection logs under `storage.path`.
    #[default]
    File,
    /// Process memory only; nothing survives a restart.
    Memory,
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend selection.
    pub backend: StorageBackend,
    /// Data directory for the file backend.
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: PathBuf::from("data"),
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["plexus_plugins=debug",
    /// "notify=warn"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
