//! Persisted plugin records.
//!
//! A [`PluginRecord`] is one row in the `plugins` collection. `enabled` is
//! the operator's declared intent; `state` is what the runtime actually did
//! with the plugin. The two are deliberately independent.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::name::PluginName;

/// Errors at or beyond this count auto-disable an active plugin.
pub const MAX_ERRORS: u32 = 5;

/// Lifecycle state of a plugin.
///
/// ```text
/// disabled → loading → active → maintenance → disabled
///               ↓         ↓
///             failed ← (error threshold)
/// ```
///
/// `Updating` is reserved for in-place upgrades; reload goes through
/// unload and load instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// An admission attempt is in progress.
    Loading,
    /// Admitted and serving.
    Active,
    /// Known but not running.
    Disabled,
    /// The last admission failed or the error threshold was reached.
    Failed,
    /// Reserved for in-place upgrades.
    Updating,
    /// Being unloaded, or its directory vanished.
    Maintenance,
}

impl PluginState {
    /// The lowercase name used in storage and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
            Self::Updating => "updating",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin that must be active before this one loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Name of the required plugin.
    pub name: String,
    /// Informational minimum version. Not enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
}

/// How the runtime obtains a plugin instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPointSpec {
    /// A worker executable speaking the JSON-lines protocol.
    Process {
        /// Executable. Paths containing a separator resolve against the
        /// plugin directory, bare names against `PATH`.
        command: String,
        /// Command-line arguments.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// A factory compiled into the host and registered by name.
    Builtin {
        /// Factory name.
        factory: String,
    },
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// Filesystem grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct FilesystemPermissions {
    /// Read inside the plugin's own directory.
    pub read_own: bool,
    /// Write inside the plugin's own directory.
    pub write_own: bool,
    /// Read inside the shared uploads directory.
    pub read_shared: bool,
    /// Write inside the shared uploads directory.
    pub write_shared: bool,
}

impl Default for FilesystemPermissions {
    fn default() -> Self {
        Self {
            read_own: true,
            write_own: true,
            read_shared: false,
            write_shared: false,
        }
    }
}

/// Data-store grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct DataStorePermissions {
    /// Read `plugin_<name>_*` collections.
    pub read_own: bool,
    /// Write `plugin_<name>_*` collections.
    pub write_own: bool,
    /// Read core collections.
    pub read_core: bool,
    /// Write core collections. Only effective together with `read_core`.
    pub write_core: bool,
}

impl Default for DataStorePermissions {
    fn default() -> Self {
        Self {
            read_own: true,
            write_own: true,
            read_core: false,
            write_core: false,
        }
    }
}

/// Outbound network grants. All off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPermissions {
    /// Outbound HTTP(S) requests.
    pub http_requests: bool,
    /// Outbound websocket connections.
    pub websockets: bool,
    /// Sending email.
    pub email_sending: bool,
}

/// Host UI grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct UiPermissions {
    /// Pages in the administration panel.
    pub admin_panel: bool,
    /// Overlays on user-facing pages.
    pub user_overlay: bool,
    /// HTTP route registration.
    pub route_registration: bool,
}

impl Default for UiPermissions {
    fn default() -> Self {
        Self {
            admin_panel: false,
            user_overlay: false,
            route_registration: true,
        }
    }
}

/// The four independent capability sets granted to a plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    /// Filesystem grants.
    pub filesystem: FilesystemPermissions,
    /// Data-store grants.
    pub data_store: DataStorePermissions,
    /// Network grants.
    pub network: NetworkPermissions,
    /// UI grants.
    pub ui: UiPermissions,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Health classification derived from a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    /// Below every warning threshold.
    Healthy,
    /// Above a warning threshold.
    Warning,
    /// Above a critical threshold.
    Critical,
    /// Never sampled.
    #[default]
    Unknown,
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        })
    }
}

/// One resource sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    /// CPU usage in percent.
    pub cpu_percent: f64,
    /// Duration of the plugin's health check, zero without one.
    pub response_time_ms: f64,
}

/// Latest health snapshot stored on the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Classification.
    pub status: HealthLevel,
    /// When the sample was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    /// The sample itself.
    #[serde(default)]
    pub metrics: HealthMetrics,
}

/// Thresholds used to classify samples. Comparisons are strict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Memory above which a plugin is `warning`.
    pub warning_memory_mb: f64,
    /// Memory above which a plugin is `critical`.
    pub critical_memory_mb: f64,
    /// CPU above which a plugin is `warning`.
    pub warning_cpu_percent: f64,
    /// CPU above which a plugin is `critical`.
    pub critical_cpu_percent: f64,
    /// Memory above which the monitor reloads the plugin.
    pub reload_memory_mb: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_memory_mb: 200.0,
            critical_memory_mb: 500.0,
            warning_cpu_percent: 50.0,
            critical_cpu_percent: 80.0,
            reload_memory_mb: 1000.0,
        }
    }
}

impl HealthThresholds {
    /// Classify a sample.
    #[must_use]
    pub fn classify(&self, metrics: &HealthMetrics) -> HealthLevel {
        if metrics.memory_mb > self.critical_memory_mb
            || metrics.cpu_percent > self.critical_cpu_percent
        {
            HealthLevel::Critical
        } else if metrics.memory_mb > self.warning_memory_mb
            || metrics.cpu_percent > self.warning_cpu_percent
        {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    /// Whether memory pressure warrants an automatic reload.
    #[must_use]
    pub fn needs_reload(&self, metrics: &HealthMetrics) -> bool {
        metrics.memory_mb > self.reload_memory_mb
    }
}

/// The most recent recorded error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Error message.
    pub message: String,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PluginRecord
// ---------------------------------------------------------------------------

/// Registry row for one installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Identity and storage key.
    pub name: PluginName,
    /// Human-readable name.
    pub display_name: String,
    /// Version string from the manifest.
    pub version: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Actual runtime status.
    pub state: PluginState,
    /// Declared intent.
    pub enabled: bool,
    /// Plugins that must be active first, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Lower loads first.
    #[serde(default)]
    pub load_priority: i64,
    /// The plugin's root directory.
    pub plugin_dir: PathBuf,
    /// `backend/` inside the plugin directory, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_path: Option<PathBuf>,
    /// `frontend/` inside the plugin directory, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_path: Option<PathBuf>,
    /// Whether a backend exists on disk.
    #[serde(default)]
    pub has_backend: bool,
    /// Whether a frontend exists on disk.
    #[serde(default)]
    pub has_frontend: bool,
    /// How to obtain an instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPointSpec>,
    /// The manifest's `[config]` table.
    #[serde(default)]
    pub config: serde_json::Value,
    /// blake3 hash of the backend sources at the last successful load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Granted capabilities.
    #[serde(default)]
    pub permissions: Permissions,
    /// Errors since the last successful load.
    #[serde(default)]
    pub error_count: u32,
    /// Most recent error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Latest health snapshot.
    #[serde(default)]
    pub health: HealthStatus,
    /// Creation time, the tie-breaker for equal priorities.
    pub created_at: DateTime<Utc>,
    /// Last successful admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    /// Last lifecycle activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl PluginRecord {
    /// Whether this record satisfies a dependency on it.
    #[must_use]
    pub fn satisfies_dependents(&self) -> bool {
        self.state == PluginState::Active && self.enabled
    }

    /// Directory whose contents are hashed for drift detection.
    #[must_use]
    pub fn source_root(&self) -> &std::path::Path {
        self.backend_path.as_deref().unwrap_or(&self.plugin_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_permissions_are_own_scoped() {
        let p = Permissions::default();
        assert!(p.filesystem.read_own && p.filesystem.write_own);
        assert!(!p.filesystem.read_shared && !p.filesystem.write_shared);
        assert!(p.data_store.read_own && !p.data_store.read_core);
        assert!(!p.network.http_requests);
        assert!(p.ui.route_registration && !p.ui.admin_panel);
    }

    #[test]
    fn thresholds_classify_strictly() {
        let t = HealthThresholds::default();
        let sample = |memory_mb, cpu_percent| HealthMetrics {
            memory_mb,
            cpu_percent,
            response_time_ms: 0.0,
        };
        assert_eq!(t.classify(&sample(100.0, 10.0)), HealthLevel::Healthy);
        assert_eq!(t.classify(&sample(200.0, 50.0)), HealthLevel::Healthy);
        assert_eq!(t.classify(&sample(201.0, 10.0)), HealthLevel::Warning);
        assert_eq!(t.classify(&sample(100.0, 51.0)), HealthLevel::Warning);
        assert_eq!(t.classify(&sample(501.0, 10.0)), HealthLevel::Critical);
        assert_eq!(t.classify(&sample(100.0, 81.0)), HealthLevel::Critical);
        assert!(!t.needs_reload(&sample(1000.0, 0.0)));
        assert!(t.needs_reload(&sample(1200.0, 0.0)));
    }

    #[test]
    fn entry_point_spec_is_tagged() {
        let spec: EntryPointSpec =
            serde_json::from_str(r#"{"type":"builtin","factory":"echo"}"#).unwrap();
        assert_eq!(
            spec,
            EntryPointSpec::Builtin {
                factory: "echo".into()
            }
        );
    }
}
