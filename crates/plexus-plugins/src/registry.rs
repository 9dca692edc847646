//! Persistent plugin registry.
//!
//! One [`PluginRecord`] per installed plugin, stored in the `plugins`
//! collection keyed by name. The registry owns discovery, load ordering,
//! error accounting and health snapshots. Read-modify-write sequences on a
//! single row are serialized by a per-name lock so concurrent callers (the
//! health monitor and a watcher-triggered reload, say) cannot lose updates.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use plexus_storage::{DocumentStore, Filter, Query};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::activity::{ActivityKind, ActivityLog, ActivityRecord, ActivityStatus, Severity};
use crate::checksum::{IGNORED_DIRS, IGNORED_FILES};
use crate::error::{PluginError, PluginResult};
use crate::locks::NamedLocks;
use crate::manifest::load_manifest;
use crate::name::PluginName;
use crate::record::{
    HealthLevel, HealthMetrics, HealthStatus, HealthThresholds, LastError, MAX_ERRORS,
    PluginRecord, PluginState,
};

/// Collection holding plugin records.
pub const PLUGINS_COLLECTION: &str = "plugins";

/// Inputs the registry needs from configuration.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Root directory; each subdirectory is one plugin.
    pub plugins_dir: PathBuf,
    /// `enabled` for new records whose manifest does not say.
    pub enable_on_discovery: bool,
    /// Health classification thresholds.
    pub thresholds: HealthThresholds,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            enable_on_discovery: true,
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Outcome of [`PluginRegistry::record_error`].
#[derive(Debug, Clone)]
pub struct ErrorRecorded {
    /// The record after the update.
    pub record: PluginRecord,
    /// Whether this call crossed the threshold and disabled the plugin.
    pub auto_disabled: bool,
}

/// Outcome of [`PluginRegistry::sync_with_filesystem`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Directories that had no record and were discovered.
    pub discovered: Vec<PluginName>,
    /// Records whose directory vanished, now in maintenance.
    pub missing: Vec<PluginName>,
    /// Maintenance records whose directory came back.
    pub restored: Vec<PluginName>,
    /// Directory names that are not valid plugin names.
    pub skipped: Vec<String>,
}

/// The plugin registry.
pub struct PluginRegistry {
    store: Arc<dyn DocumentStore>,
    activity: ActivityLog,
    settings: RegistrySettings,
    rows: NamedLocks,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Create a registry over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, activity: ActivityLog, settings: RegistrySettings) -> Self {
        Self {
            store,
            activity,
            settings,
            rows: NamedLocks::new(),
        }
    }

    /// The plugin root directory.
    #[must_use]
    pub fn plugins_dir(&self) -> &Path {
        &self.settings.plugins_dir
    }

    /// Health classification thresholds.
    #[must_use]
    pub fn thresholds(&self) -> &HealthThresholds {
        &self.settings.thresholds
    }

    /// Directory a plugin of this name lives in.
    #[must_use]
    pub fn plugin_dir(&self, name: &PluginName) -> PathBuf {
        let dir = self.settings.plugins_dir.join(name.as_str());
        std::path::absolute(&dir).unwrap_or(dir)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Fetch a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the row is corrupt.
    pub async fn get(&self, name: &str) -> PluginResult<Option<PluginRecord>> {
        match self.store.get(PLUGINS_COLLECTION, name).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Fetch a record that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn require(&self, name: &str) -> PluginResult<PluginRecord> {
        self.get(name)
            .await?
            .ok_or_else(|| PluginError::NotFound(name.to_owned()))
    }

    /// Every record, sorted by name. Corrupt rows are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn list(&self) -> PluginResult<Vec<PluginRecord>> {
        let docs = self
            .store
            .find(PLUGINS_COLLECTION, &Query::new(Filter::all()))
            .await?;
        let mut records: Vec<PluginRecord> = docs
            .into_iter()
            .filter_map(|doc| match serde_json::from_value::<PluginRecord>(doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupt plugin record");
                    None
                },
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Enabled records sorted by `(load_priority, created_at)`.
    ///
    /// This is the first-pass order only; admission still waits for
    /// dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn load_order(&self) -> PluginResult<Vec<PluginRecord>> {
        let mut records: Vec<PluginRecord> = self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        records.sort_by(|a, b| {
            a.load_priority
                .cmp(&b.load_priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Create a record for a plugin directory in state `disabled`.
    ///
    /// Idempotent: an existing record is returned untouched.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the directory does not exist, or
    /// a manifest error if `plugin.toml` is malformed.
    pub async fn discover(&self, name: &PluginName) -> PluginResult<PluginRecord> {
        if let Some(existing) = self.get(name.as_str()).await? {
            return Ok(existing);
        }

        let _row = self.rows.acquire(name.as_str()).await;
        let record = self.build_record(name)?;
        let inserted = self
            .store
            .insert(PLUGINS_COLLECTION, name.as_str(), serde_json::to_value(&record)?)
            .await?;
        if !inserted {
            // Lost a race with another discoverer; theirs wins.
            return self.require(name.as_str()).await;
        }

        info!(
            plugin = %name,
            version = %record.version,
            enabled = record.enabled,
            dependencies = record.dependencies.len(),
            "Discovered plugin"
        );
        self.activity
            .record(
                ActivityRecord::new(name.as_str(), ActivityKind::PluginDiscovered, "Plugin discovered")
                    .status(ActivityStatus::Info)
                    .details(json!({
                        "version": record.version,
                        "has_backend": record.has_backend,
                        "has_frontend": record.has_frontend,
                    })),
            )
            .await;
        Ok(record)
    }

    /// Re-read the manifest and replace the record's derived metadata.
    ///
    /// Lifecycle fields (state, enabled, errors, health, checksum and
    /// timestamps) are kept. This is the only discovery path that
    /// overwrites. Without an existing record it behaves like
    /// [`discover`](Self::discover).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the directory does not exist, or
    /// a manifest error if `plugin.toml` is malformed.
    pub async fn rediscover(&self, name: &PluginName) -> PluginResult<PluginRecord> {
        let row = self.rows.acquire(name.as_str()).await;
        let Some(existing) = self.get(name.as_str()).await? else {
            drop(row);
            return self.discover(name).await;
        };

        let mut fresh = self.build_record(name)?;
        fresh.state = existing.state;
        fresh.enabled = existing.enabled;
        fresh.error_count = existing.error_count;
        fresh.last_error = existing.last_error;
        fresh.health = existing.health;
        fresh.checksum = existing.checksum;
        fresh.created_at = existing.created_at;
        fresh.loaded_at = existing.loaded_at;
        fresh.last_activity = existing.last_activity;

        self.save(&fresh).await?;
        info!(plugin = %name, version = %fresh.version, "Re-discovered plugin metadata");
        self.activity
            .record(
                ActivityRecord::new(name.as_str(), ActivityKind::PluginDiscovered, "Plugin metadata refreshed")
                    .status(ActivityStatus::Info)
                    .details(json!({ "rediscovered": true, "version": fresh.version })),
            )
            .await;
        Ok(fresh)
    }

    fn build_record(&self, name: &PluginName) -> PluginResult<PluginRecord> {
        let plugin_dir = self.plugin_dir(name);
        if !plugin_dir.is_dir() {
            return Err(PluginError::NotFound(name.to_string()));
        }

        let manifest = load_manifest(&plugin_dir)?.unwrap_or_default();
        let entry_point = manifest.entry_point(&plugin_dir)?;
        let backend = plugin_dir.join("backend");
        let frontend = plugin_dir.join("frontend");
        let has_backend = backend.is_dir() || entry_point.is_some();
        let has_frontend = frontend.is_dir();

        Ok(PluginRecord {
            name: name.clone(),
            display_name: manifest
                .display_name
                .clone()
                .unwrap_or_else(|| name.to_string()),
            version: manifest.version.clone().unwrap_or_else(|| "0.0.0".into()),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            state: PluginState::Disabled,
            enabled: manifest.enabled.unwrap_or(self.settings.enable_on_discovery),
            dependencies: manifest.dependencies(),
            load_priority: manifest.load_priority.unwrap_or(0),
            backend_path: backend.is_dir().then_some(backend),
            frontend_path: has_frontend.then_some(frontend),
            plugin_dir,
            has_backend,
            has_frontend,
            entry_point,
            config: serde_json::Value::Object(manifest.config),
            checksum: None,
            permissions: manifest.permissions,
            error_count: 0,
            last_error: None,
            health: HealthStatus::default(),
            created_at: Utc::now(),
            loaded_at: None,
            last_activity: None,
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Replace a record wholesale.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn save(&self, record: &PluginRecord) -> PluginResult<()> {
        self.store
            .upsert(
                PLUGINS_COLLECTION,
                record.name.as_str(),
                serde_json::to_value(record)?,
            )
            .await?;
        Ok(())
    }

    /// Apply `f` to a record under its row lock and persist the result.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn modify<F>(&self, name: &str, f: F) -> PluginResult<PluginRecord>
    where
        F: FnOnce(&mut PluginRecord) + Send,
    {
        let _row = self.rows.acquire(name).await;
        let mut record = self.require(name).await?;
        f(&mut record);
        self.save(&record).await?;
        Ok(record)
    }

    /// Set the lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn set_state(&self, name: &str, state: PluginState) -> PluginResult<PluginRecord> {
        debug!(plugin = %name, state = %state, "Plugin state change");
        self.modify(name, |r| {
            r.state = state;
            r.last_activity = Some(Utc::now());
        })
        .await
    }

    /// Set the declared intent.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> PluginResult<PluginRecord> {
        let record = self.modify(name, |r| r.enabled = enabled).await?;
        let (kind, message) = if enabled {
            (ActivityKind::PluginEnabled, "Plugin enabled")
        } else {
            (ActivityKind::PluginDisabled, "Plugin disabled")
        };
        info!(plugin = %name, enabled, "Plugin intent changed");
        self.activity
            .record(
                ActivityRecord::new(name, kind, message)
                    .status(ActivityStatus::Info)
                    .severity(Severity::Medium),
            )
            .await;
        Ok(record)
    }

    /// Increment the error count and store the error.
    ///
    /// When the count reaches [`MAX_ERRORS`] while the plugin is `active`,
    /// the plugin moves to `failed` with `enabled = false`. Later errors
    /// only increment and log.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn record_error(&self, name: &str, message: &str) -> PluginResult<ErrorRecorded> {
        let mut auto_disabled = false;
        let record = self
            .modify(name, |r| {
                r.error_count = r.error_count.saturating_add(1);
                r.last_error = Some(LastError {
                    message: message.to_owned(),
                    at: Utc::now(),
                });
                if r.error_count >= MAX_ERRORS && r.state == PluginState::Active {
                    r.state = PluginState::Failed;
                    r.enabled = false;
                    auto_disabled = true;
                }
            })
            .await?;

        warn!(
            plugin = %name,
            error_count = record.error_count,
            error = %message,
            "Plugin error recorded"
        );
        self.activity
            .record(
                ActivityRecord::new(name, ActivityKind::PluginError, message)
                    .status(ActivityStatus::Failure)
                    .severity(Severity::Medium)
                    .details(json!({ "error_count": record.error_count })),
            )
            .await;

        if auto_disabled {
            warn!(
                plugin = %name,
                error_count = record.error_count,
                "Error threshold reached, plugin disabled"
            );
            self.activity
                .record(
                    ActivityRecord::new(
                        name,
                        ActivityKind::PluginDisabled,
                        format!("Disabled after {} errors", record.error_count),
                    )
                    .status(ActivityStatus::Failure)
                    .severity(Severity::Critical)
                    .details(json!({ "last_error": message })),
                )
                .await;
        }

        Ok(ErrorRecorded {
            record,
            auto_disabled,
        })
    }

    /// Store a health sample and classify it.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn update_health(&self, name: &str, metrics: HealthMetrics) -> PluginResult<HealthLevel> {
        let level = self.settings.thresholds.classify(&metrics);
        self.modify(name, |r| {
            r.health = HealthStatus {
                status: level,
                last_check: Some(Utc::now()),
                metrics,
            };
        })
        .await?;

        let (status, severity) = match level {
            HealthLevel::Healthy | HealthLevel::Unknown => (ActivityStatus::Success, Severity::Low),
            HealthLevel::Warning => (ActivityStatus::Warning, Severity::Medium),
            HealthLevel::Critical => (ActivityStatus::Warning, Severity::High),
        };
        debug!(
            plugin = %name,
            status = %level,
            memory_mb = metrics.memory_mb,
            cpu_percent = metrics.cpu_percent,
            response_time_ms = metrics.response_time_ms,
            "Health sample stored"
        );
        self.activity
            .record(
                ActivityRecord::new(name, ActivityKind::HealthCheck, format!("Health {level}"))
                    .status(status)
                    .severity(severity)
                    .details(serde_json::to_value(metrics)?),
            )
            .await;
        Ok(level)
    }

    /// Put a plugin whose directory vanished into maintenance.
    ///
    /// The record is kept for audit history.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn mark_missing(&self, name: &str) -> PluginResult<PluginRecord> {
        let record = self
            .modify(name, |r| {
                r.state = PluginState::Maintenance;
                r.enabled = false;
                r.last_activity = Some(Utc::now());
            })
            .await?;
        warn!(plugin = %name, "Plugin directory missing, marked maintenance");
        self.activity
            .record(
                ActivityRecord::new(name, ActivityKind::Maintenance, "Plugin directory removed")
                    .status(ActivityStatus::Warning)
                    .severity(Severity::Medium),
            )
            .await;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Filesystem reconciliation
    // -----------------------------------------------------------------------

    /// Reconcile records against the plugin directories on disk.
    ///
    /// Unknown directories are discovered. Records whose directory vanished
    /// go to `maintenance` with `enabled = false`; nothing is deleted.
    /// Maintenance records whose directory is back are refreshed and settle
    /// at `disabled`, still not enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails. Individual malformed manifests
    /// are logged and skipped.
    pub async fn sync_with_filesystem(&self) -> PluginResult<SyncReport> {
        let mut report = SyncReport::default();
        let (present, skipped) = scan_plugin_dirs(&self.settings.plugins_dir);
        report.skipped = skipped;

        let existing = self.list().await?;
        let known: BTreeSet<&PluginName> = existing.iter().map(|r| &r.name).collect();

        for name in present.iter().filter(|n| !known.contains(n)) {
            match self.discover(name).await {
                Ok(_) => report.discovered.push(name.clone()),
                Err(e) => warn!(plugin = %name, error = %e, "Failed to discover plugin"),
            }
        }

        for record in &existing {
            let on_disk = present.contains(&record.name) && record.plugin_dir.is_dir();
            let parked = record.state == PluginState::Maintenance && !record.enabled;
            if !on_disk && !parked {
                self.mark_missing(record.name.as_str()).await?;
                report.missing.push(record.name.clone());
            } else if on_disk && record.state == PluginState::Maintenance {
                match self.rediscover(&record.name).await {
                    Ok(_) => {
                        self.set_state(record.name.as_str(), PluginState::Disabled)
                            .await?;
                        report.restored.push(record.name.clone());
                    },
                    Err(e) => warn!(plugin = %record.name, error = %e, "Failed to restore plugin"),
                }
            }
        }

        info!(
            discovered = report.discovered.len(),
            missing = report.missing.len(),
            restored = report.restored.len(),
            skipped = report.skipped.len(),
            "Registry synchronized with plugin directory"
        );
        Ok(report)
    }
}

/// List plugin directories under `root`.
///
/// Returns valid names and the directory names that were skipped because
/// they are not valid plugin names. Ignored metadata directories are
/// dropped silently. A missing root yields nothing.
pub fn scan_plugin_dirs(root: &Path) -> (BTreeSet<PluginName>, Vec<String>) {
    let mut present = BTreeSet::new();
    let mut skipped = Vec::new();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Cannot read plugin directory");
            return (present, skipped);
        },
    };

    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let raw = entry.file_name().to_string_lossy().into_owned();
        if IGNORED_DIRS.contains(&raw.as_str()) || IGNORED_FILES.contains(&raw.as_str()) {
            continue;
        }
        match PluginName::new(raw.clone()) {
            Ok(name) => {
                present.insert(name);
            },
            Err(e) => {
                warn!(dir = %raw, error = %e, "Skipping directory with invalid plugin name");
                skipped.push(raw);
            },
        }
    }
    (present, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_storage::MemoryDocumentStore;
    use tempfile::TempDir;

    fn registry(dir: &Path) -> (PluginRegistry, ActivityLog) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let activity = ActivityLog::new(Arc::clone(&store), 90);
        let settings = RegistrySettings {
            plugins_dir: dir.to_path_buf(),
            ..RegistrySettings::default()
        };
        (
            PluginRegistry::new(store, activity.clone(), settings),
            activity,
        )
    }

    fn plugin(root: &Path, name: &str, manifest: &str) -> PluginName {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("plugin.toml"), manifest).unwrap();
        PluginName::new(name).unwrap()
    }

    #[tokio::test]
    async fn discover_twice_yields_one_row() {
        let tmp = TempDir::new().unwrap();
        let (registry, activity) = registry(tmp.path());
        let name = plugin(tmp.path(), "billing", "version = \"1.0.0\"\n");

        let first = registry.discover(&name).await.unwrap();
        assert_eq!(first.state, PluginState::Disabled);
        assert!(first.enabled);

        // Second discovery must not overwrite, even after the manifest changes.
        std::fs::write(tmp.path().join("billing/plugin.toml"), "version = \"2.0.0\"\n").unwrap();
        let second = registry.discover(&name).await.unwrap();
        assert_eq!(second.version, "1.0.0");
        assert_eq!(registry.list().await.unwrap().len(), 1);

        let discovered = activity
            .of_kind("billing", ActivityKind::PluginDiscovered)
            .await
            .unwrap();
        assert_eq!(discovered.len(), 1);
    }

    #[tokio::test]
    async fn rediscover_refreshes_metadata_but_keeps_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = registry(tmp.path());
        let name = plugin(tmp.path(), "billing", "version = \"1.0.0\"\n");
        registry.discover(&name).await.unwrap();
        registry.set_state("billing", PluginState::Active).await.unwrap();

        std::fs::write(
            tmp.path().join("billing/plugin.toml"),
            "version = \"2.0.0\"\ndependencies = [\"licensing\"]\n",
        )
        .unwrap();
        let refreshed = registry.rediscover(&name).await.unwrap();
        assert_eq!(refreshed.version, "2.0.0");
        assert_eq!(refreshed.dependencies.len(), 1);
        assert_eq!(refreshed.state, PluginState::Active);
    }

    #[tokio::test]
    async fn discover_requires_directory() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = registry(tmp.path());
        let err = registry
            .discover(&PluginName::new("ghost").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_order_sorts_by_priority_then_creation() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = registry(tmp.path());
        for (name, manifest) in [
            ("late", "load_priority = 20\n"),
            ("first", "load_priority = 1\n"),
            ("off", "load_priority = 0\nenabled = false\n"),
            ("second", "load_priority = 20\n"),
        ] {
            let name = plugin(tmp.path(), name, manifest);
            registry.discover(&name).await.unwrap();
        }

        let order: Vec<String> = registry
            .load_order()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name.to_string())
            .collect();
        assert_eq!(order, vec!["first", "late", "second"]);
    }

    #[tokio::test]
    async fn fifth_error_disables_active_plugin() {
        let tmp = TempDir::new().unwrap();
        let (registry, activity) = registry(tmp.path());
        let name = plugin(tmp.path(), "flaky", "");
        registry.discover(&name).await.unwrap();
        registry.set_state("flaky", PluginState::Active).await.unwrap();

        for i in 1..=4 {
            let out = registry.record_error("flaky", "boom").await.unwrap();
            assert_eq!(out.record.error_count, i);
            assert!(!out.auto_disabled);
            assert_eq!(out.record.state, PluginState::Active);
        }

        let fifth = registry.record_error("flaky", "boom").await.unwrap();
        assert!(fifth.auto_disabled);
        assert_eq!(fifth.record.state, PluginState::Failed);
        assert!(!fifth.record.enabled);

        let sixth = registry.record_error("flaky", "boom").await.unwrap();
        assert!(!sixth.auto_disabled);
        assert_eq!(sixth.record.error_count, 6);

        let disabled = activity
            .of_kind("flaky", ActivityKind::PluginDisabled)
            .await
            .unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn update_health_classifies() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = registry(tmp.path());
        let name = plugin(tmp.path(), "billing", "");
        registry.discover(&name).await.unwrap();

        let level = registry
            .update_health(
                "billing",
                HealthMetrics {
                    memory_mb: 300.0,
                    cpu_percent: 10.0,
                    response_time_ms: 4.0,
                },
            )
            .await
            .unwrap();
        assert_eq!(level, HealthLevel::Warning);

        let record = registry.require("billing").await.unwrap();
        assert_eq!(record.health.status, HealthLevel::Warning);
        assert!(record.health.last_check.is_some());
        assert!((record.health.metrics.response_time_ms - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sync_discovers_marks_missing_and_restores() {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = registry(tmp.path());
        plugin(tmp.path(), "billing", "");
        plugin(tmp.path(), "seo", "");
        std::fs::create_dir_all(tmp.path().join("Bad_Name")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();

        let report = registry.sync_with_filesystem().await.unwrap();
        assert_eq!(report.discovered.len(), 2);
        assert_eq!(report.skipped, vec!["Bad_Name".to_string()]);

        std::fs::remove_dir_all(tmp.path().join("seo")).unwrap();
        let report = registry.sync_with_filesystem().await.unwrap();
        assert_eq!(report.missing, vec![PluginName::new("seo").unwrap()]);
        let seo = registry.require("seo").await.unwrap();
        assert_eq!(seo.state, PluginState::Maintenance);
        assert!(!seo.enabled);

        // Already parked: a second sync changes nothing.
        let report = registry.sync_with_filesystem().await.unwrap();
        assert!(report.missing.is_empty());

        plugin(tmp.path(), "seo", "");
        let report = registry.sync_with_filesystem().await.unwrap();
        assert_eq!(report.restored, vec![PluginName::new("seo").unwrap()]);
        let seo = registry.require("seo").await.unwrap();
        assert_eq!(seo.state, PluginState::Disabled);
        assert!(!seo.enabled);
    }
}
