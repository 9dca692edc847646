//! The plugin runtime: owner of the loaded-set.
//!
//! [`PluginRuntime`] ties the registry, sandbox mediator, host application
//! and entry-point resolver together and owns the in-memory set of loaded
//! instances. Every component that needs the loaded-set gets an
//! `Arc<PluginRuntime>`; there is no ambient global state.
//!
//! Lifecycle operations (load, unload, reload, rollback) on one plugin are
//! serialized by a per-name lock. Different plugins proceed in parallel.
//! The operations themselves live in `loader.rs` and `rollback.rs`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use plexus_storage::DocumentStore;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::activity::{ActivityKind, ActivityLog, ActivityRecord, ActivityStatus};
use crate::error::{PluginError, PluginResult};
use crate::host::{HostApplication, PluginHost};
use crate::locks::NamedLocks;
use crate::name::PluginName;
use crate::plugin::{EntryPointResolver, Plugin};
use crate::record::{HealthThresholds, PluginState};
use crate::registry::{ErrorRecorded, PluginRegistry, RegistrySettings};
use crate::rollback::RollbackController;
use crate::sandbox::{SandboxMediator, SandboxSettings};

/// Runtime configuration, converted from the daemon's config file.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Root directory; each subdirectory is one plugin.
    pub plugins_dir: PathBuf,
    /// Shared uploads directory.
    pub shared_dir: PathBuf,
    /// `enabled` for newly discovered plugins whose manifest does not say.
    pub enable_on_discovery: bool,
    /// Collections reachable with core data-store grants.
    pub core_collections: Vec<String>,
    /// Bound on entry-point instantiation and registration.
    pub entry_timeout: Duration,
    /// Bound on a plugin's cleanup hook.
    pub cleanup_timeout: Duration,
    /// Health classification thresholds.
    pub thresholds: HealthThresholds,
    /// Health sweep period.
    pub health_interval: Duration,
    /// Bound on a single health check call.
    pub health_check_timeout: Duration,
    /// Activity records expire this many days after creation.
    pub activity_retention_days: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let sandbox = SandboxSettings::default();
        Self {
            plugins_dir: PathBuf::from("plugins"),
            shared_dir: sandbox.shared_dir,
            enable_on_discovery: true,
            core_collections: sandbox.core_collections,
            entry_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(10),
            thresholds: HealthThresholds::default(),
            health_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            activity_retention_days: 90,
        }
    }
}

/// An admitted instance.
#[derive(Clone)]
pub struct LoadedPlugin {
    /// The instance.
    pub instance: Arc<dyn Plugin>,
    /// When it was admitted.
    pub loaded_at: DateTime<Utc>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("instance", &self.instance)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// The plugin runtime.
pub struct PluginRuntime {
    pub(crate) settings: RuntimeSettings,
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) activity: ActivityLog,
    pub(crate) sandbox: Arc<SandboxMediator>,
    pub(crate) host: Arc<dyn HostApplication>,
    pub(crate) resolver: Arc<dyn EntryPointResolver>,
    pub(crate) loaded: DashMap<PluginName, LoadedPlugin>,
    pub(crate) rollback: RollbackController,
    pub(crate) lifecycle: NamedLocks,
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("settings", &self.settings)
            .field("loaded", &self.loaded_names())
            .finish_non_exhaustive()
    }
}

impl PluginRuntime {
    /// Assemble a runtime over `store`.
    #[must_use]
    pub fn new(
        settings: RuntimeSettings,
        store: Arc<dyn DocumentStore>,
        host: Arc<dyn HostApplication>,
        resolver: Arc<dyn EntryPointResolver>,
    ) -> Arc<Self> {
        let activity = ActivityLog::new(Arc::clone(&store), settings.activity_retention_days);
        let registry = Arc::new(PluginRegistry::new(
            Arc::clone(&store),
            activity.clone(),
            RegistrySettings {
                plugins_dir: settings.plugins_dir.clone(),
                enable_on_discovery: settings.enable_on_discovery,
                thresholds: settings.thresholds,
            },
        ));
        let sandbox = Arc::new(SandboxMediator::new(
            Arc::clone(&registry),
            activity.clone(),
            store,
            SandboxSettings {
                shared_dir: settings.shared_dir.clone(),
                core_collections: settings.core_collections.clone(),
            },
        ));

        Arc::new(Self {
            settings,
            registry,
            activity,
            sandbox,
            host,
            resolver,
            loaded: DashMap::new(),
            rollback: RollbackController::new(),
            lifecycle: NamedLocks::new(),
        })
    }

    /// Runtime settings.
    #[must_use]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// The plugin registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The activity log.
    #[must_use]
    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// The sandbox mediator.
    #[must_use]
    pub fn sandbox(&self) -> &Arc<SandboxMediator> {
        &self.sandbox
    }

    /// The host application.
    #[must_use]
    pub fn host(&self) -> &Arc<dyn HostApplication> {
        &self.host
    }

    /// Whether `name` is in the loaded-set.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    /// The loaded instance for `name`.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.loaded.get(name).map(|l| Arc::clone(&l.instance))
    }

    /// The loaded-set entry for `name`.
    #[must_use]
    pub fn loaded_plugin(&self, name: &str) -> Option<LoadedPlugin> {
        self.loaded.get(name).map(|l| l.value().clone())
    }

    /// Names in the loaded-set, sorted.
    #[must_use]
    pub fn loaded_names(&self) -> Vec<PluginName> {
        let mut names: Vec<PluginName> = self.loaded.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Change the declared intent.
    ///
    /// Disabling a loaded plugin unloads it. Enabling only records intent;
    /// the plugin is admitted by the next load.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> PluginResult<()> {
        let _guard = self.lifecycle.acquire(name).await;
        self.registry.set_enabled(name, enabled).await?;
        if !enabled && self.is_loaded(name) {
            self.unload_locked(name, false, "disabled").await?;
        }
        Ok(())
    }

    /// Record a runtime error reported for a plugin.
    ///
    /// When this crosses the error threshold the registry marks the plugin
    /// failed and disabled, and the instance is stopped here.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn report_error(&self, name: &str, message: &str) -> PluginResult<ErrorRecorded> {
        let outcome = self.registry.record_error(name, message).await?;
        if outcome.auto_disabled {
            let _guard = self.lifecycle.acquire(name).await;
            if let Some(loaded) = self.detach(&outcome.record.name).await {
                self.cleanup_instance(&outcome.record.name, &loaded.instance)
                    .await;
                self.rollback.discard(name);
                warn!(plugin = %name, "Plugin stopped after repeated errors");
            }
        }
        Ok(outcome)
    }

    /// Clean up every loaded instance.
    ///
    /// Records settle at `disabled` with `enabled` untouched so the next
    /// start admits the same set.
    pub async fn shutdown(&self) {
        let names = self.loaded_names();
        info!(count = names.len(), "Shutting down plugins");
        for name in names {
            let _guard = self.lifecycle.acquire(name.as_str()).await;
            let Some(loaded) = self.detach(&name).await else {
                continue;
            };
            self.cleanup_instance(&name, &loaded.instance).await;
            self.rollback.discard(name.as_str());
            if let Err(e) = self
                .registry
                .set_state(name.as_str(), PluginState::Disabled)
                .await
            {
                warn!(plugin = %name, error = %e, "Failed to persist shutdown state");
            }
            self.activity
                .record(
                    ActivityRecord::new(name.as_str(), ActivityKind::PluginUnloaded, "Plugin stopped")
                        .status(ActivityStatus::Info)
                        .details(json!({ "shutdown": true })),
                )
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    pub(crate) fn plugin_host(&self, name: &PluginName) -> PluginHost {
        PluginHost::new(name.clone(), Arc::clone(&self.host), Arc::clone(&self.sandbox))
    }

    /// Run `register` under the entry timeout.
    pub(crate) async fn register_instance(
        &self,
        name: &PluginName,
        instance: &Arc<dyn Plugin>,
    ) -> PluginResult<()> {
        let host = self.plugin_host(name);
        let timeout = self.settings.entry_timeout;
        match tokio::time::timeout(timeout, instance.register(&host)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(name, "register", timeout)),
        }
    }

    /// Run `cleanup` under the cleanup timeout. Failures are logged only.
    pub(crate) async fn cleanup_instance(&self, name: &PluginName, instance: &Arc<dyn Plugin>) {
        let timeout = self.settings.cleanup_timeout;
        match tokio::time::timeout(timeout, instance.cleanup()).await {
            Ok(Ok(())) => debug!(plugin = %name, "Cleanup complete"),
            Ok(Err(e)) => warn!(plugin = %name, error = %e, "Cleanup failed"),
            Err(_) => warn!(
                plugin = %name,
                timeout_secs = timeout.as_secs(),
                "Cleanup timed out"
            ),
        }
    }

    /// Remove an instance from the loaded-set and from every host surface.
    pub(crate) async fn detach(&self, name: &PluginName) -> Option<LoadedPlugin> {
        let removed = self.loaded.remove(name).map(|(_, loaded)| loaded);
        self.host.remove_plugin_surfaces(name).await;
        self.host.retract_instance(name).await;
        removed
    }
}

pub(crate) fn timeout_error(name: &PluginName, operation: &'static str, timeout: Duration) -> PluginError {
    PluginError::Timeout {
        plugin: name.to_string(),
        operation,
        secs: timeout.as_secs(),
    }
}
