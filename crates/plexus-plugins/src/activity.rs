//! Append-only, expiring activity log.
//!
//! One row per lifecycle, security or I/O event, tagged with the plugin name.
//! Rows carry an expiry timestamp; [`ActivityLog::prune_expired`] removes the
//! ones that have passed it and is driven by the daemon, not by the
//! runtime's own control flow.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use plexus_storage::{DocumentStore, Filter, Query, SortOrder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::PluginResult;

/// Collection holding activity rows.
pub const ACTIVITY_COLLECTION: &str = "plugin_activity";

/// Default retention for activity rows.
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A new registry row was created (or refreshed by re-discovery).
    PluginDiscovered,
    /// First admission succeeded.
    PluginLoaded,
    /// An admission attempt failed.
    PluginFailed,
    /// The plugin was unloaded.
    PluginUnloaded,
    /// A forced load or reload succeeded.
    PluginHotReloaded,
    /// A failed attempt was rolled back to the last good instance.
    PluginRecovered,
    /// The plugin was disabled, by an operator or the error threshold.
    PluginDisabled,
    /// An operator enabled the plugin.
    PluginEnabled,
    /// A runtime error was recorded against the plugin.
    PluginError,
    /// A health sample was stored.
    HealthCheck,
    /// An allowed filesystem access.
    FileAccess,
    /// An allowed data-store access.
    DataAccess,
    /// An allowed network access.
    NetworkAccess,
    /// An allowed UI registration.
    UiAccess,
    /// A denied access of any kind.
    PermissionViolation,
    /// The plugin directory vanished.
    Maintenance,
    /// Backend sources changed since the last successful load.
    ChecksumDrift,
}

impl ActivityKind {
    /// The snake-case name used in storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PluginDiscovered => "plugin_discovered",
            Self::PluginLoaded => "plugin_loaded",
            Self::PluginFailed => "plugin_failed",
            Self::PluginUnloaded => "plugin_unloaded",
            Self::PluginHotReloaded => "plugin_hot_reloaded",
            Self::PluginRecovered => "plugin_recovered",
            Self::PluginDisabled => "plugin_disabled",
            Self::PluginEnabled => "plugin_enabled",
            Self::PluginError => "plugin_error",
            Self::HealthCheck => "health_check",
            Self::FileAccess => "file_access",
            Self::DataAccess => "data_access",
            Self::NetworkAccess => "network_access",
            Self::UiAccess => "ui_access",
            Self::PermissionViolation => "permission_violation",
            Self::Maintenance => "maintenance",
            Self::ChecksumDrift => "checksum_drift",
        }
    }

    /// Default category for this kind.
    #[must_use]
    pub fn category(self) -> ActivityCategory {
        match self {
            Self::FileAccess | Self::DataAccess | Self::NetworkAccess | Self::UiAccess => {
                ActivityCategory::Access
            },
            Self::PermissionViolation | Self::ChecksumDrift => ActivityCategory::Security,
            Self::HealthCheck => ActivityCategory::Health,
            _ => ActivityCategory::Lifecycle,
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse grouping used by audit views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    /// Load, unload, reload, rollback, enable/disable.
    Lifecycle,
    /// Permission violations and integrity drift.
    Security,
    /// Mediated resource access.
    Access,
    /// Health sampling.
    Health,
}

/// Outcome of the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// The action succeeded.
    Success,
    /// The action failed or was refused.
    Failure,
    /// The action succeeded with a concern.
    Warning,
    /// Informational.
    Info,
}

/// How much an operator should care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine.
    Low,
    /// Worth a look.
    Medium,
    /// Needs attention.
    High,
    /// A plugin was forcibly stopped.
    Critical,
}

/// One activity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Row id.
    pub id: Uuid,
    /// Plugin the event concerns.
    pub plugin: String,
    /// What happened.
    pub kind: ActivityKind,
    /// Coarse grouping.
    pub category: ActivityCategory,
    /// Outcome.
    pub status: ActivityStatus,
    /// Importance.
    pub severity: Severity,
    /// Human-readable summary.
    pub message: String,
    /// Structured detail.
    #[serde(default)]
    pub details: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Creation time in epoch milliseconds, for range queries.
    pub created_at_ms: i64,
    /// Expiry time in epoch milliseconds.
    pub expires_at_ms: i64,
}

impl ActivityRecord {
    /// Start a record. Status defaults to `success`, severity to `low`.
    #[must_use]
    pub fn new(plugin: impl Into<String>, kind: ActivityKind, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            plugin: plugin.into(),
            kind,
            category: kind.category(),
            status: ActivityStatus::Success,
            severity: Severity::Low,
            message: message.into(),
            details: Value::Null,
            created_at: now,
            created_at_ms: now.timestamp_millis(),
            expires_at_ms: now.timestamp_millis(),
        }
    }

    /// Set the outcome.
    #[must_use]
    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the severity.
    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach structured detail.
    #[must_use]
    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Mark as a refused or failed action at high severity.
    #[must_use]
    pub fn failure(self) -> Self {
        self.status(ActivityStatus::Failure).severity(Severity::High)
    }
}

/// Writer and reader for the activity collection.
#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn DocumentStore>,
    retention: chrono::Duration,
}

impl fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityLog")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl ActivityLog {
    /// Create a log over `store`, keeping rows for `retention_days`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, retention_days: u32) -> Self {
        Self {
            store,
            retention: chrono::Duration::days(i64::from(retention_days)),
        }
    }

    /// Persist a record, stamping its expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn try_record(&self, mut record: ActivityRecord) -> PluginResult<()> {
        record.expires_at_ms = record
            .created_at
            .checked_add_signed(self.retention)
            .map_or(i64::MAX, |t| t.timestamp_millis());
        let id = record.id.to_string();
        let doc = serde_json::to_value(&record)?;
        self.store.insert(ACTIVITY_COLLECTION, &id, doc).await?;
        Ok(())
    }

    /// Persist a record, logging instead of failing when the store is down.
    ///
    /// Activity logging never aborts the action being logged.
    pub async fn record(&self, record: ActivityRecord) {
        let plugin = record.plugin.clone();
        let kind = record.kind;
        if let Err(e) = self.try_record(record).await {
            warn!(plugin = %plugin, kind = %kind, error = %e, "Failed to write activity record");
        }
    }

    /// Most recent records for one plugin, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn for_plugin(&self, plugin: &str, limit: usize) -> PluginResult<Vec<ActivityRecord>> {
        let query = Query::new(Filter::all().eq("plugin", plugin))
            .sort_by("created_at_ms", SortOrder::Descending)
            .limit(limit);
        self.query(&query).await
    }

    /// Every record of one kind for one plugin, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn of_kind(&self, plugin: &str, kind: ActivityKind) -> PluginResult<Vec<ActivityRecord>> {
        let query = Query::new(
            Filter::all()
                .eq("plugin", plugin)
                .eq("kind", kind.as_str()),
        )
        .sort_by("created_at_ms", SortOrder::Ascending);
        self.query(&query).await
    }

    /// Counts per kind, optionally restricted to one plugin.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn count_by_kind(&self, plugin: Option<&str>) -> PluginResult<BTreeMap<String, u64>> {
        let filter = match plugin {
            Some(p) => Filter::all().eq("plugin", p),
            None => Filter::all(),
        };
        Ok(self
            .store
            .count_by(ACTIVITY_COLLECTION, "kind", &filter)
            .await?)
    }

    /// Delete every record whose expiry is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> PluginResult<u64> {
        let filter = Filter::all().lte("expires_at_ms", now.timestamp_millis());
        Ok(self.store.delete_many(ACTIVITY_COLLECTION, &filter).await?)
    }

    async fn query(&self, query: &Query) -> PluginResult<Vec<ActivityRecord>> {
        self.store
            .find(ACTIVITY_COLLECTION, query)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_storage::MemoryDocumentStore;

    fn log() -> ActivityLog {
        ActivityLog::new(Arc::new(MemoryDocumentStore::new()), 90)
    }

    #[tokio::test]
    async fn records_are_queryable_by_plugin_and_kind() {
        let log = log();
        log.record(ActivityRecord::new("billing", ActivityKind::PluginLoaded, "loaded"))
            .await;
        log.record(
            ActivityRecord::new("billing", ActivityKind::PermissionViolation, "denied").failure(),
        )
        .await;
        log.record(ActivityRecord::new("seo", ActivityKind::PluginLoaded, "loaded"))
            .await;

        let billing = log.for_plugin("billing", 10).await.unwrap();
        assert_eq!(billing.len(), 2);

        let violations = log
            .of_kind("billing", ActivityKind::PermissionViolation)
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::High);
        assert_eq!(violations[0].category, ActivityCategory::Security);

        let counts = log.count_by_kind(None).await.unwrap();
        assert_eq!(counts.get("plugin_loaded"), Some(&2));
    }

    #[tokio::test]
    async fn expiry_is_stamped_from_retention() {
        let log = log();
        let record = ActivityRecord::new("billing", ActivityKind::PluginLoaded, "loaded");
        let created = record.created_at;
        log.try_record(record).await.unwrap();

        let stored = log.for_plugin("billing", 1).await.unwrap().remove(0);
        let expected = created + chrono::Duration::days(90);
        assert_eq!(stored.expires_at_ms, expected.timestamp_millis());
    }

    #[tokio::test]
    async fn prune_removes_only_expired_rows() {
        let log = log();
        log.record(ActivityRecord::new("billing", ActivityKind::PluginLoaded, "loaded"))
            .await;

        assert_eq!(log.prune_expired(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::days(91);
        assert_eq!(log.prune_expired(later).await.unwrap(), 1);
        assert!(log.for_plugin("billing", 10).await.unwrap().is_empty());
    }
}
