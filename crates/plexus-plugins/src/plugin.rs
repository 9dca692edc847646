//! Plugin trait, entry points and entry-point resolution.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{PluginError, PluginResult};
use crate::host::PluginHost;
use crate::name::PluginName;
use crate::process::ProcessPlugin;
use crate::record::{EntryPointSpec, PluginRecord};
use crate::sandbox::PluginSandbox;

/// A loaded plugin instance.
///
/// Instances are shared (`Arc<dyn Plugin>`) between the loaded-set and
/// rollback points, so every hook takes `&self`; implementations use
/// interior mutability for their own state.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The plugin's name.
    fn name(&self) -> &PluginName;

    /// Register routes and UI with the host. Required.
    ///
    /// May be called again on the same instance when a rollback restores
    /// it after its cleanup hook already ran.
    async fn register(&self, host: &PluginHost) -> PluginResult<()>;

    /// Release resources on unload.
    async fn cleanup(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Whether [`health_check`](Self::health_check) is implemented.
    fn supports_health_check(&self) -> bool {
        false
    }

    /// Liveness probe, timed by the health monitor.
    async fn health_check(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Receive the mediated resource handle. Called before `register`.
    fn attach_sandbox(&self, _sandbox: PluginSandbox) {}

    /// OS process backing this instance, when it runs out of process.
    fn process_id(&self) -> Option<u32> {
        None
    }
}

impl fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", self.name())
            .field("pid", &self.process_id())
            .finish_non_exhaustive()
    }
}

/// Everything an entry point needs to build an instance.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Plugin name.
    pub name: PluginName,
    /// Plugin version.
    pub version: String,
    /// Plugin directory.
    pub plugin_dir: PathBuf,
    /// The manifest's `[config]` table.
    pub config: serde_json::Value,
    /// Bound applied to each round trip with plugin code.
    pub call_timeout: Duration,
}

impl PluginContext {
    /// Build a context from a registry record.
    #[must_use]
    pub fn from_record(record: &PluginRecord, call_timeout: Duration) -> Self {
        Self {
            name: record.name.clone(),
            version: record.version.clone(),
            plugin_dir: record.plugin_dir.clone(),
            config: record.config.clone(),
            call_timeout,
        }
    }
}

/// A resolved way of producing an instance.
#[async_trait]
pub trait EntryPoint: Send + Sync {
    /// The file that must exist for the plugin to be intact, if any.
    fn entry_file(&self) -> Option<PathBuf>;

    /// Produce a fresh instance.
    async fn instantiate(&self, ctx: &PluginContext) -> PluginResult<Arc<dyn Plugin>>;
}

/// Maps a record's [`EntryPointSpec`] to an [`EntryPoint`].
pub trait EntryPointResolver: Send + Sync {
    /// Resolve the entry point for `record`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MissingEntryPoint`] or
    /// [`PluginError::UnknownFactory`] when nothing can be resolved.
    fn resolve(&self, record: &PluginRecord) -> PluginResult<Box<dyn EntryPoint>>;
}

/// Constructor for an in-process plugin.
pub type PluginFactory =
    Arc<dyn Fn(&PluginContext) -> PluginResult<Arc<dyn Plugin>> + Send + Sync>;

/// Resolver for subprocess workers and registered builtin factories.
#[derive(Default, Clone)]
pub struct StandardResolver {
    builtins: HashMap<String, PluginFactory>,
}

impl fmt::Debug for StandardResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.builtins.keys().collect();
        names.sort();
        f.debug_struct("StandardResolver")
            .field("builtins", &names)
            .finish()
    }
}

impl StandardResolver {
    /// A resolver with no builtins.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process factory under `name`.
    #[must_use]
    pub fn with_builtin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginContext) -> PluginResult<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.builtins.insert(name.into(), Arc::new(factory));
        self
    }
}

impl EntryPointResolver for StandardResolver {
    fn resolve(&self, record: &PluginRecord) -> PluginResult<Box<dyn EntryPoint>> {
        match &record.entry_point {
            None => Err(PluginError::MissingEntryPoint(record.name.to_string())),
            Some(EntryPointSpec::Builtin { factory }) => {
                let f = self
                    .builtins
                    .get(factory)
                    .ok_or_else(|| PluginError::UnknownFactory {
                        plugin: record.name.to_string(),
                        factory: factory.clone(),
                    })?;
                Ok(Box::new(BuiltinEntryPoint {
                    factory: Arc::clone(f),
                }))
            },
            Some(EntryPointSpec::Process { command, args, env }) => Ok(Box::new(ProcessEntryPoint {
                program: resolve_command(&record.plugin_dir, command),
                args: args.clone(),
                env: env.clone().into_iter().collect(),
            })),
        }
    }
}

/// Resolve a worker command.
///
/// Commands containing a path separator resolve against the plugin
/// directory; bare names are looked up on `PATH` and fall back to the
/// plugin directory when not found there.
#[must_use]
pub fn resolve_command(plugin_dir: &std::path::Path, command: &str) -> PathBuf {
    if command.contains('/') || command.contains(std::path::MAIN_SEPARATOR) {
        return plugin_dir.join(command);
    }
    which::which(command).unwrap_or_else(|_| plugin_dir.join(command))
}

struct BuiltinEntryPoint {
    factory: PluginFactory,
}

#[async_trait]
impl EntryPoint for BuiltinEntryPoint {
    fn entry_file(&self) -> Option<PathBuf> {
        None
    }

    async fn instantiate(&self, ctx: &PluginContext) -> PluginResult<Arc<dyn Plugin>> {
        (self.factory)(ctx)
    }
}

struct ProcessEntryPoint {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

#[async_trait]
impl EntryPoint for ProcessEntryPoint {
    fn entry_file(&self) -> Option<PathBuf> {
        Some(self.program.clone())
    }

    async fn instantiate(&self, ctx: &PluginContext) -> PluginResult<Arc<dyn Plugin>> {
        Ok(Arc::new(ProcessPlugin::new(
            ctx,
            self.program.clone(),
            self.args.clone(),
            self.env.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HealthStatus, Permissions, PluginState};
    use chrono::Utc;

    struct Noop(PluginName);

    #[async_trait]
    impl Plugin for Noop {
        fn name(&self) -> &PluginName {
            &self.0
        }
        async fn register(&self, _host: &PluginHost) -> PluginResult<()> {
            Ok(())
        }
    }

    fn record(entry_point: Option<EntryPointSpec>) -> PluginRecord {
        PluginRecord {
            name: PluginName::new("billing").unwrap(),
            display_name: "billing".into(),
            version: "1.0.0".into(),
            description: None,
            author: None,
            state: PluginState::Disabled,
            enabled: true,
            dependencies: Vec::new(),
            load_priority: 0,
            plugin_dir: PathBuf::from("/srv/plugins/billing"),
            backend_path: None,
            frontend_path: None,
            has_backend: entry_point.is_some(),
            has_frontend: false,
            entry_point,
            config: serde_json::Value::Null,
            checksum: None,
            permissions: Permissions::default(),
            error_count: 0,
            last_error: None,
            health: HealthStatus::default(),
            created_at: Utc::now(),
            loaded_at: None,
            last_activity: None,
        }
    }

    #[tokio::test]
    async fn resolves_registered_builtin() {
        let resolver = StandardResolver::new()
            .with_builtin("noop", |ctx| Ok(Arc::new(Noop(ctx.name.clone())) as Arc<dyn Plugin>));
        let rec = record(Some(EntryPointSpec::Builtin {
            factory: "noop".into(),
        }));
        let entry = resolver.resolve(&rec).unwrap();
        assert!(entry.entry_file().is_none());

        let ctx = PluginContext::from_record(&rec, Duration::from_secs(1));
        let instance = entry.instantiate(&ctx).await.unwrap();
        assert_eq!(instance.name().as_str(), "billing");
        assert!(!instance.supports_health_check());
    }

    #[test]
    fn unknown_builtin_and_missing_backend_fail() {
        let resolver = StandardResolver::new();
        let err = resolver
            .resolve(&record(Some(EntryPointSpec::Builtin {
                factory: "nope".into(),
            })))
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::UnknownFactory { .. }));

        let err = resolver.resolve(&record(None)).err().unwrap();
        assert!(matches!(err, PluginError::MissingEntryPoint(_)));
    }

    #[test]
    fn relative_commands_resolve_inside_plugin_dir() {
        let dir = std::path::Path::new("/srv/plugins/billing");
        assert_eq!(
            resolve_command(dir, "backend/worker"),
            dir.join("backend/worker")
        );
        assert_eq!(
            resolve_command(dir, "definitely-not-on-path-xyz"),
            dir.join("definitely-not-on-path-xyz")
        );
    }
}
