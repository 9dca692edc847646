//! Dependency-ordered loading, unloading and hot reload.
//!
//! Single-plugin admission runs under the plugin's lifecycle lock:
//! dependency check, rollback snapshot, `loading`, entry point, integrity,
//! sandbox attach, registration, `active`. Any failure after the state
//! change goes through rollback before it is returned.
//!
//! Bulk loading admits plugins in waves. A plugin joins a wave once every
//! dependency was admitted in an earlier wave; plugins within a wave load
//! concurrently. Whatever cannot be admitted is reported with a reason,
//! including the members of any dependency cycle.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityKind, ActivityRecord, ActivityStatus};
use crate::checksum::compute_source_hash;
use crate::error::{PluginError, PluginResult};
use crate::host::InstanceInfo;
use crate::name::PluginName;
use crate::plugin::{EntryPoint, Plugin, PluginContext};
use crate::record::{PluginRecord, PluginState};
use crate::rollback::RollbackOutcome;
use crate::runtime::{LoadedPlugin, PluginRuntime, timeout_error};

/// Options for [`PluginRuntime::load_plugin`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Load again even if the plugin is already active.
    pub force: bool,
    /// Skip the dependency check.
    pub skip_dependencies: bool,
}

impl LoadOptions {
    /// Options with `force` set.
    #[must_use]
    pub fn force() -> Self {
        Self {
            force: true,
            skip_dependencies: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadCause {
    Load,
    Reload,
}

impl LoadCause {
    fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Reload => "reload",
        }
    }
}

/// Why a plugin was not attempted by the bulk loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// A dependency has no registry record.
    MissingDependency(String),
    /// A dependency exists but is not enabled.
    DisabledDependency(String),
    /// A dependency was attempted and failed.
    DependencyFailed(String),
    /// A dependency is itself unresolved.
    DependencyUnresolved(String),
    /// The plugin is part of a dependency cycle with these members.
    DependencyCycle(Vec<String>),
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDependency(dep) => write!(f, "dependency {dep} is not installed"),
            Self::DisabledDependency(dep) => write!(f, "dependency {dep} is disabled"),
            Self::DependencyFailed(dep) => write!(f, "dependency {dep} failed to load"),
            Self::DependencyUnresolved(dep) => write!(f, "dependency {dep} is unresolved"),
            Self::DependencyCycle(members) => {
                write!(f, "dependency cycle: {}", members.join(" -> "))
            },
        }
    }
}

/// A plugin the bulk loader could not attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    /// The plugin.
    pub name: PluginName,
    /// Why.
    pub reason: UnresolvedReason,
}

/// A plugin whose load attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedLoad {
    /// The plugin.
    pub name: PluginName,
    /// The load error.
    pub error: String,
}

/// Outcome of [`PluginRuntime::load_all_enabled`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkLoadReport {
    /// Admitted plugins, in admission order.
    pub loaded: Vec<PluginName>,
    /// Plugins that were attempted and failed.
    pub failed: Vec<FailedLoad>,
    /// Plugins that were never attempted.
    pub unresolved: Vec<Unresolved>,
    /// Number of admission waves run.
    pub waves: usize,
}

impl BulkLoadReport {
    /// Whether every enabled plugin was admitted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.unresolved.is_empty()
    }
}

impl PluginRuntime {
    // -----------------------------------------------------------------------
    // Single plugin
    // -----------------------------------------------------------------------

    /// Load one plugin.
    ///
    /// An already active plugin is returned as is unless `force` is set;
    /// that path performs no registry writes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] without touching state when the
    /// record is in `maintenance` and its directory is gone, and
    /// [`PluginError::DependencyNotSatisfied`] without touching state when
    /// a dependency is not active and enabled. Entry-point,
    /// integrity, timeout and registration failures are returned after the
    /// plugin has been rolled back.
    pub async fn load_plugin(&self, name: &str, options: LoadOptions) -> PluginResult<Arc<dyn Plugin>> {
        let name = PluginName::new(name)?;
        let _guard = self.lifecycle.acquire(name.as_str()).await;
        self.load_locked(&name, options, LoadCause::Load).await
    }

    async fn load_locked(
        &self,
        name: &PluginName,
        options: LoadOptions,
        cause: LoadCause,
    ) -> PluginResult<Arc<dyn Plugin>> {
        let record = match self.registry.get(name.as_str()).await? {
            Some(record) => record,
            None => self.registry.discover(name).await?,
        };

        // Parked by the watcher or a sync; keep the marker until the
        // directory comes back.
        if record.state == PluginState::Maintenance && !record.plugin_dir.is_dir() {
            warn!(plugin = %name, "Plugin directory is missing, not loading");
            return Err(PluginError::NotFound(name.to_string()));
        }

        if record.state == PluginState::Active
            && !options.force
            && let Some(instance) = self.instance(name.as_str())
        {
            debug!(plugin = %name, "Plugin already active");
            return Ok(instance);
        }

        if !options.skip_dependencies {
            self.check_dependencies(&record).await?;
        }

        if !self.rollback.has_point(name.as_str()) {
            self.snapshot(name.as_str());
        }

        match self.admit(name, &record, cause).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                let message = e.to_string();
                error!(plugin = %name, cause = cause.as_str(), error = %message, "Plugin load failed");
                let outcome = self.rollback_locked(name, &message).await;
                let restored = matches!(outcome, RollbackOutcome::Restored { .. });
                self.activity
                    .record(
                        ActivityRecord::new(name.as_str(), ActivityKind::PluginFailed, format!("Load failed: {message}"))
                            .failure()
                            .details(json!({
                                "error": message,
                                "cause": cause.as_str(),
                                "rolled_back": restored,
                            })),
                    )
                    .await;
                Err(e)
            },
        }
    }

    async fn check_dependencies(&self, record: &PluginRecord) -> PluginResult<()> {
        for dep in &record.dependencies {
            let reason = match self.registry.get(&dep.name).await? {
                None => "not installed".to_owned(),
                Some(d) if !d.enabled => "disabled".to_owned(),
                Some(d) if d.state != PluginState::Active => d.state.to_string(),
                Some(_) => continue,
            };
            warn!(plugin = %record.name, dependency = %dep.name, reason = %reason, "Dependency not satisfied");
            return Err(PluginError::DependencyNotSatisfied {
                plugin: record.name.to_string(),
                dependency: dep.name.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// Steps from `loading` to `active`.
    async fn admit(
        &self,
        name: &PluginName,
        record: &PluginRecord,
        cause: LoadCause,
    ) -> PluginResult<Arc<dyn Plugin>> {
        self.registry
            .set_state(name.as_str(), PluginState::Loading)
            .await?;

        let entry = self.resolver.resolve(record)?;
        let ctx = PluginContext::from_record(record, self.settings.entry_timeout);
        let timeout = self.settings.entry_timeout;
        let instance = tokio::time::timeout(timeout, entry.instantiate(&ctx))
            .await
            .map_err(|_| timeout_error(name, "entry point", timeout))??;

        let checksum = self.verify_integrity(record, entry.as_ref()).await?;
        instance.attach_sandbox(
            self.sandbox
                .sandbox_for(name.clone(), record.plugin_dir.clone()),
        );

        // The previous instance stays loaded until the new one is ready to
        // take over its routes.
        if let Some(previous) = self.detach(name).await {
            debug!(plugin = %name, "Retiring previous instance");
            self.cleanup_instance(name, &previous.instance).await;
        }

        if let Err(e) = self.register_instance(name, &instance).await {
            self.host.remove_plugin_surfaces(name).await;
            self.cleanup_instance(name, &instance).await;
            return Err(e);
        }

        let loaded_at = Utc::now();
        self.loaded.insert(
            name.clone(),
            LoadedPlugin {
                instance: Arc::clone(&instance),
                loaded_at,
            },
        );
        let persisted = self
            .registry
            .modify(name.as_str(), |r| {
                r.state = PluginState::Active;
                r.loaded_at = Some(loaded_at);
                r.last_activity = Some(loaded_at);
                r.error_count = 0;
                if checksum.is_some() {
                    r.checksum.clone_from(&checksum);
                }
            })
            .await;
        let record = match persisted {
            Ok(record) => record,
            Err(e) => {
                self.detach(name).await;
                self.cleanup_instance(name, &instance).await;
                return Err(e);
            },
        };

        self.host
            .publish_instance(
                name,
                InstanceInfo {
                    version: record.version.clone(),
                    loaded_at,
                    pid: instance.process_id(),
                },
            )
            .await;
        self.rollback.discard(name.as_str());

        let (kind, message) = match cause {
            LoadCause::Load => (ActivityKind::PluginLoaded, "Plugin loaded"),
            LoadCause::Reload => (ActivityKind::PluginHotReloaded, "Plugin hot reloaded"),
        };
        info!(
            plugin = %name,
            version = %record.version,
            cause = cause.as_str(),
            pid = ?instance.process_id(),
            "Plugin active"
        );
        self.activity
            .record(
                ActivityRecord::new(name.as_str(), kind, message).details(json!({
                    "version": record.version,
                    "checksum": record.checksum,
                })),
            )
            .await;
        Ok(instance)
    }

    /// Check expected files and recompute the source checksum.
    ///
    /// A missing entry file or plugin directory fails the load. A checksum
    /// that differs from the stored one is only reported.
    async fn verify_integrity(
        &self,
        record: &PluginRecord,
        entry: &dyn EntryPoint,
    ) -> PluginResult<Option<String>> {
        let integrity = |message: String| PluginError::IntegrityFailed {
            plugin: record.name.to_string(),
            message,
        };
        if !record.plugin_dir.is_dir() {
            return Err(integrity("plugin directory is missing".into()));
        }
        if let Some(file) = entry.entry_file()
            && !file.is_file()
        {
            return Err(integrity(format!("entry file {} is missing", file.display())));
        }

        let root = record.source_root().to_path_buf();
        let hash = match tokio::task::spawn_blocking(move || compute_source_hash(&root)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                warn!(plugin = %record.name, error = %e, "Could not hash plugin sources");
                return Ok(None);
            },
            Err(e) => {
                warn!(plugin = %record.name, error = %e, "Source hashing task failed");
                return Ok(None);
            },
        };

        if let Some(previous) = &record.checksum
            && previous != &hash
        {
            info!(plugin = %record.name, previous = %previous, current = %hash, "Plugin sources changed");
            self.activity
                .record(
                    ActivityRecord::new(record.name.as_str(), ActivityKind::ChecksumDrift, "Plugin sources changed")
                        .status(ActivityStatus::Info)
                        .details(json!({ "previous": previous, "current": hash })),
                )
                .await;
        }
        Ok(Some(hash))
    }

    /// Unload one plugin and set `enabled = false`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no record.
    pub async fn unload_plugin(&self, name: &str) -> PluginResult<()> {
        let _guard = self.lifecycle.acquire(name).await;
        self.unload_locked(name, false, "unload").await
    }

    pub(crate) async fn unload_locked(
        &self,
        name: &str,
        keep_enabled: bool,
        reason: &'static str,
    ) -> PluginResult<()> {
        let record = self.registry.require(name).await?;
        let name = record.name;
        if record.state == PluginState::Active {
            self.registry
                .set_state(name.as_str(), PluginState::Maintenance)
                .await?;
        }

        if let Some(instance) = self.instance(name.as_str()) {
            self.cleanup_instance(&name, &instance).await;
        }
        self.detach(&name).await;
        if !keep_enabled {
            self.rollback.discard(name.as_str());
        }

        self.registry
            .modify(name.as_str(), |r| {
                r.state = PluginState::Disabled;
                if !keep_enabled {
                    r.enabled = false;
                }
                r.last_activity = Some(Utc::now());
            })
            .await?;

        info!(plugin = %name, reason, "Plugin unloaded");
        self.activity
            .record(
                ActivityRecord::new(name.as_str(), ActivityKind::PluginUnloaded, "Plugin unloaded")
                    .status(ActivityStatus::Info)
                    .details(json!({ "reason": reason })),
            )
            .await;
        Ok(())
    }

    /// Unload then load with `force`, keeping `enabled`.
    ///
    /// For subprocess plugins this restarts the worker. If the load half
    /// fails the previous instance is restored when there was one.
    ///
    /// # Errors
    ///
    /// Returns the load error after rollback.
    pub async fn reload_plugin(&self, name: &str) -> PluginResult<Arc<dyn Plugin>> {
        let name = PluginName::new(name)?;
        let _guard = self.lifecycle.acquire(name.as_str()).await;

        self.snapshot(name.as_str());
        if self.is_loaded(name.as_str()) {
            self.unload_locked(name.as_str(), true, "reload").await?;
        }

        let result = self
            .load_locked(&name, LoadOptions::force(), LoadCause::Reload)
            .await;
        if let Err(e) = &result
            && self.rollback.has_point(name.as_str())
        {
            // Failed before admission started, so the point is untouched.
            self.rollback_locked(&name, &e.to_string()).await;
        }
        result
    }

    // -----------------------------------------------------------------------
    // Bulk
    // -----------------------------------------------------------------------

    /// Load every enabled plugin in dependency order.
    ///
    /// One plugin's failure never stops the others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry cannot be read.
    pub async fn load_all_enabled(&self) -> PluginResult<BulkLoadReport> {
        let order = self.registry.load_order().await?;
        let known: HashMap<String, PluginRecord> = self
            .registry
            .list()
            .await?
            .into_iter()
            .map(|r| (r.name.to_string(), r))
            .collect();
        let enabled: HashSet<&str> = order.iter().map(|r| r.name.as_str()).collect();

        let mut report = BulkLoadReport::default();
        let mut admitted: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut unresolved: HashSet<String> = HashSet::new();
        let mut pending: Vec<&PluginRecord> = Vec::new();

        for record in &order {
            let blocker = record.dependencies.iter().find_map(|dep| {
                if !known.contains_key(&dep.name) {
                    Some(UnresolvedReason::MissingDependency(dep.name.clone()))
                } else if !enabled.contains(dep.name.as_str()) {
                    Some(UnresolvedReason::DisabledDependency(dep.name.clone()))
                } else {
                    None
                }
            });
            match blocker {
                Some(reason) => {
                    unresolved.insert(record.name.to_string());
                    report.unresolved.push(Unresolved {
                        name: record.name.clone(),
                        reason,
                    });
                },
                None => pending.push(record),
            }
        }

        loop {
            propagate_blocked(&mut pending, &failed, &mut unresolved, &mut report);

            let (ready, waiting): (Vec<&PluginRecord>, Vec<&PluginRecord>) =
                pending.into_iter().partition(|r| {
                    r.dependencies
                        .iter()
                        .all(|d| d.name != r.name.as_str() && admitted.contains(&d.name))
                });
            pending = waiting;
            if ready.is_empty() {
                break;
            }

            report.waves = report.waves.saturating_add(1);
            debug!(
                wave = report.waves,
                plugins = ?ready.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
                "Starting admission wave"
            );
            let results = join_all(ready.iter().map(|r| {
                let options = LoadOptions {
                    force: false,
                    skip_dependencies: r.dependencies.is_empty(),
                };
                self.load_plugin(r.name.as_str(), options)
            }))
            .await;

            for (record, result) in ready.into_iter().zip(results) {
                match result {
                    Ok(_) => {
                        admitted.insert(record.name.to_string());
                        report.loaded.push(record.name.clone());
                    },
                    Err(e) => {
                        failed.insert(record.name.to_string());
                        report.failed.push(FailedLoad {
                            name: record.name.clone(),
                            error: e.to_string(),
                        });
                    },
                }
            }
        }

        if !pending.is_empty() {
            for cycle in dependency_cycles(&pending) {
                let members: Vec<String> = cycle.iter().map(|r| r.name.to_string()).collect();
                warn!(members = ?members, "Dependency cycle detected");
                for record in cycle {
                    unresolved.insert(record.name.to_string());
                    report.unresolved.push(Unresolved {
                        name: record.name.clone(),
                        reason: UnresolvedReason::DependencyCycle(members.clone()),
                    });
                }
            }
            pending.retain(|r| !unresolved.contains(r.name.as_str()));
            propagate_blocked(&mut pending, &failed, &mut unresolved, &mut report);
            for record in pending {
                let dep = record
                    .dependencies
                    .first()
                    .map(|d| d.name.clone())
                    .unwrap_or_default();
                report.unresolved.push(Unresolved {
                    name: record.name.clone(),
                    reason: UnresolvedReason::DependencyUnresolved(dep),
                });
            }
        }

        for item in &report.unresolved {
            warn!(plugin = %item.name, reason = %item.reason, "Plugin left unresolved");
        }
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            unresolved = report.unresolved.len(),
            waves = report.waves,
            "Bulk load complete"
        );
        Ok(report)
    }
}

/// Move pending plugins whose dependencies failed or are unresolved into
/// the report, until nothing changes.
fn propagate_blocked(
    pending: &mut Vec<&PluginRecord>,
    failed: &HashSet<String>,
    unresolved: &mut HashSet<String>,
    report: &mut BulkLoadReport,
) {
    loop {
        let mut changed = false;
        pending.retain(|record| {
            let reason = record.dependencies.iter().find_map(|d| {
                if failed.contains(&d.name) {
                    Some(UnresolvedReason::DependencyFailed(d.name.clone()))
                } else if unresolved.contains(&d.name) {
                    Some(UnresolvedReason::DependencyUnresolved(d.name.clone()))
                } else {
                    None
                }
            });
            match reason {
                Some(reason) => {
                    unresolved.insert(record.name.to_string());
                    report.unresolved.push(Unresolved {
                        name: record.name.clone(),
                        reason,
                    });
                    changed = true;
                    false
                },
                None => true,
            }
        });
        if !changed {
            break;
        }
    }
}

/// Strongly connected components of `records` that form cycles, following
/// dependency edges within the set. Self-dependencies count. Members are
/// sorted by name and cycles by their first member.
fn dependency_cycles<'a>(records: &[&'a PluginRecord]) -> Vec<Vec<&'a PluginRecord>> {
    let position: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.as_str(), i))
        .collect();
    let adjacency: Vec<Vec<usize>> = records
        .iter()
        .map(|r| {
            r.dependencies
                .iter()
                .filter_map(|d| position.get(d.name.as_str()).copied())
                .collect()
        })
        .collect();

    let mut cycles: Vec<Vec<&PluginRecord>> = strongly_connected(&adjacency)
        .into_iter()
        .filter(|component| match component.as_slice() {
            [single] => adjacency[*single].contains(single),
            _ => true,
        })
        .map(|component| {
            let mut members: Vec<&PluginRecord> = component.into_iter().map(|i| records[i]).collect();
            members.sort_by(|a, b| a.name.cmp(&b.name));
            members
        })
        .collect();
    cycles.sort_by(|a, b| a.first().map(|r| &r.name).cmp(&b.first().map(|r| &r.name)));
    cycles
}

/// Tarjan's algorithm.
fn strongly_connected(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    struct State<'a> {
        adjacency: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next: usize,
        components: Vec<Vec<usize>>,
    }

    impl State<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next);
            self.lowlink[v] = self.next;
            self.next = self.next.saturating_add(1);
            self.stack.push(v);
            self.on_stack[v] = true;

            let adjacency = self.adjacency;
            for &w in &adjacency[v] {
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                    },
                    Some(iw) if self.on_stack[w] => {
                        self.lowlink[v] = self.lowlink[v].min(iw);
                    },
                    Some(_) => {},
                }
            }

            if self.index[v] == Some(self.lowlink[v]) {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let n = adjacency.len();
    let mut state = State {
        adjacency,
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        components: Vec::new(),
    };
    for v in 0..n {
        if state.index[v].is_none() {
            state.visit(v);
        }
    }
    state.components
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tarjan_finds_cycles_and_singletons() {
        // 0 -> 1 -> 2 -> 0, 3 -> 3, 4 -> 0
        let adjacency = vec![vec![1], vec![2], vec![0], vec![3], vec![0]];
        let mut components: Vec<Vec<usize>> = strongly_connected(&adjacency)
            .into_iter()
            .map(|mut c| {
                c.sort_unstable();
                c
            })
            .collect();
        components.sort();
        assert_eq!(components, vec![vec![0, 1, 2], vec![3], vec![4]]);
    }

    #[test]
    fn unresolved_reasons_read_well() {
        let cycle = UnresolvedReason::DependencyCycle(vec!["a".into(), "b".into()]);
        assert_eq!(cycle.to_string(), "dependency cycle: a -> b");
        assert_eq!(
            UnresolvedReason::DisabledDependency("licensing".into()).to_string(),
            "dependency licensing is disabled"
        );
    }
}
