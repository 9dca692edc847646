//! Rollback points and recovery.
//!
//! A rollback point is the most recent known-good instance of a plugin,
//! captured before a reload replaces it. Only one point per plugin is kept.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{error, info, warn};

use crate::activity::{ActivityKind, ActivityRecord, ActivityStatus, Severity};
use crate::host::InstanceInfo;
use crate::name::PluginName;
use crate::plugin::Plugin;
use crate::record::PluginState;
use crate::runtime::{LoadedPlugin, PluginRuntime};

/// A captured instance.
#[derive(Clone)]
pub struct RollbackPoint {
    /// The instance to restore.
    pub instance: Arc<dyn Plugin>,
    /// When it was admitted originally.
    pub loaded_at: DateTime<Utc>,
    /// When the point was taken.
    pub created_at: DateTime<Utc>,
}

/// Per-plugin rollback points.
#[derive(Default)]
pub struct RollbackController {
    points: DashMap<String, RollbackPoint>,
}

impl std::fmt::Debug for RollbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackController")
            .field("points", &self.points.len())
            .finish()
    }
}

impl RollbackController {
    /// An empty controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture `loaded`, replacing any earlier point for `name`.
    pub fn create_point(&self, name: &str, loaded: &LoadedPlugin) -> DateTime<Utc> {
        let created_at = Utc::now();
        self.points.insert(
            name.to_owned(),
            RollbackPoint {
                instance: Arc::clone(&loaded.instance),
                loaded_at: loaded.loaded_at,
                created_at,
            },
        );
        created_at
    }

    /// Remove and return the point for `name`.
    pub fn take(&self, name: &str) -> Option<RollbackPoint> {
        self.points.remove(name).map(|(_, p)| p)
    }

    /// Drop the point for `name`.
    pub fn discard(&self, name: &str) {
        self.points.remove(name);
    }

    /// Whether a point exists for `name`.
    #[must_use]
    pub fn has_point(&self, name: &str) -> bool {
        self.points.contains_key(name)
    }
}

/// What [`PluginRuntime::rollback`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The previous instance is back in the loaded-set.
    Restored {
        /// When the restored point was taken.
        at: DateTime<Utc>,
    },
    /// No usable point; the plugin is unloaded and marked failed.
    Failed,
}

impl PluginRuntime {
    /// Capture the loaded instance of `name` as its rollback point.
    ///
    /// Returns `false` when nothing is loaded.
    pub async fn create_rollback_point(&self, name: &str) -> bool {
        let _guard = self.lifecycle.acquire(name).await;
        self.snapshot(name)
    }

    pub(crate) fn snapshot(&self, name: &str) -> bool {
        let Some(loaded) = self.loaded_plugin(name) else {
            return false;
        };
        let at = self.rollback.create_point(name, &loaded);
        info!(plugin = %name, at = %at, "Rollback point created");
        true
    }

    /// Recover `name` after `error`.
    pub async fn rollback(&self, name: &PluginName, error: &str) -> RollbackOutcome {
        let _guard = self.lifecycle.acquire(name.as_str()).await;
        self.rollback_locked(name, error).await
    }

    /// [`rollback`](Self::rollback) with the lifecycle lock already held.
    ///
    /// With a point, its instance is put back into the loaded-set and
    /// registered again, state returns to `active` and `enabled` is left
    /// as it is. Without a point (or if the restored instance cannot
    /// register) the plugin is removed from the loaded-set, marked
    /// `failed`, and the error is recorded.
    pub(crate) async fn rollback_locked(&self, name: &PluginName, error: &str) -> RollbackOutcome {
        if let Some(point) = self.rollback.take(name.as_str()) {
            match self.restore(name, &point, error).await {
                Ok(()) => return RollbackOutcome::Restored { at: point.created_at },
                Err(e) => {
                    error!(plugin = %name, error = %e, "Restored instance failed to register");
                    self.cleanup_instance(name, &point.instance).await;
                },
            }
        }

        if let Some(loaded) = self.detach(name).await {
            self.cleanup_instance(name, &loaded.instance).await;
        }
        if let Err(e) = self.registry.set_state(name.as_str(), PluginState::Failed).await {
            warn!(plugin = %name, error = %e, "Failed to persist failed state");
        }
        if let Err(e) = self.registry.record_error(name.as_str(), error).await {
            warn!(plugin = %name, error = %e, "Failed to record plugin error");
        }
        warn!(plugin = %name, error = %error, "No rollback point, plugin marked failed");
        RollbackOutcome::Failed
    }

    async fn restore(
        &self,
        name: &PluginName,
        point: &RollbackPoint,
        error: &str,
    ) -> crate::error::PluginResult<()> {
        let loaded_at = point.loaded_at;
        let still_loaded = self
            .loaded_plugin(name.as_str())
            .is_some_and(|l| same_instance(&l.instance, &point.instance));
        if !still_loaded {
            // Surfaces left over from the failed attempt belong to the new
            // instance; the restored one registers its own.
            self.host.remove_plugin_surfaces(name).await;
            self.register_instance(name, &point.instance).await?;
            self.loaded.insert(
                name.clone(),
                LoadedPlugin {
                    instance: Arc::clone(&point.instance),
                    loaded_at,
                },
            );
        }
        let record = self
            .registry
            .modify(name.as_str(), |r| {
                r.state = PluginState::Active;
                r.loaded_at = Some(loaded_at);
                r.last_activity = Some(Utc::now());
            })
            .await?;
        self.host
            .publish_instance(
                name,
                InstanceInfo {
                    version: record.version.clone(),
                    loaded_at,
                    pid: point.instance.process_id(),
                },
            )
            .await;

        info!(
            plugin = %name,
            rollback_at = %point.created_at,
            error = %error,
            "Plugin rolled back to previous instance"
        );
        self.activity
            .record(
                ActivityRecord::new(name.as_str(), ActivityKind::PluginRecovered, "Rolled back to previous instance")
                    .status(ActivityStatus::Warning)
                    .severity(Severity::Medium)
                    .details(json!({
                        "error": error,
                        "rollback_timestamp": point.created_at.to_rfc3339(),
                    })),
            )
            .await;
        Ok(())
    }
}

fn same_instance(a: &Arc<dyn Plugin>, b: &Arc<dyn Plugin>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
