//! Shared fixtures for runtime integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plexus_plugins::{
    ActivityKind, InMemoryHost, Plugin, PluginContext, PluginError, PluginHost, PluginName,
    PluginResult, PluginRuntime, RuntimeSettings, StandardResolver,
};
use plexus_storage::MemoryDocumentStore;
use tempfile::TempDir;

/// Knobs and counters shared between a test and the instances it creates.
#[derive(Default)]
pub struct Probe {
    /// Plugins in the order their `register` ran.
    pub registered: Mutex<Vec<String>>,
    /// Number of instances created by the factory.
    pub instances: AtomicUsize,
    /// Number of `cleanup` calls.
    pub cleanups: AtomicUsize,
    /// Instances created while this is set fail `register`.
    pub fail_register: AtomicBool,
    /// Make the health check fail.
    pub fail_health: AtomicBool,
    /// Sleep this long inside `register`.
    pub register_delay: Mutex<Option<Duration>>,
}

impl Probe {
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

/// In-process plugin that registers one route named after itself.
pub struct RecorderPlugin {
    name: PluginName,
    probe: Arc<Probe>,
    broken: bool,
}

#[async_trait]
impl Plugin for RecorderPlugin {
    fn name(&self) -> &PluginName {
        &self.name
    }

    async fn register(&self, host: &PluginHost) -> PluginResult<()> {
        let delay = *self.probe.register_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.broken {
            return Err(PluginError::EntryPointFailed {
                plugin: self.name.to_string(),
                message: "register refused".into(),
            });
        }
        host.register_route("GET", &format!("/api/{}", self.name))
            .await?;
        self.probe
            .registered
            .lock()
            .unwrap()
            .push(self.name.to_string());
        Ok(())
    }

    async fn cleanup(&self) -> PluginResult<()> {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_health_check(&self) -> bool {
        true
    }

    async fn health_check(&self) -> PluginResult<()> {
        if self.probe.fail_health.load(Ordering::SeqCst) {
            return Err(PluginError::HealthCheckFailed {
                plugin: self.name.to_string(),
                message: "not ready".into(),
            });
        }
        Ok(())
    }
}

/// A resolver whose `recorder` builtin produces [`RecorderPlugin`]s.
pub fn recorder_resolver(probe: &Arc<Probe>) -> StandardResolver {
    let probe = Arc::clone(probe);
    StandardResolver::new().with_builtin("recorder", move |ctx: &PluginContext| {
        probe.instances.fetch_add(1, Ordering::SeqCst);
        let plugin: Arc<dyn Plugin> = Arc::new(RecorderPlugin {
            name: ctx.name.clone(),
            probe: Arc::clone(&probe),
            broken: probe.fail_register.load(Ordering::SeqCst),
        });
        Ok(plugin)
    })
}

/// Create `root/name/plugin.toml` with `manifest`.
pub fn write_plugin(root: &Path, name: &str, manifest: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.toml"), manifest).unwrap();
}

/// Manifest for a `recorder` builtin with the given dependencies.
pub fn recorder_manifest(dependencies: &[&str]) -> String {
    let deps: Vec<String> = dependencies.iter().map(|d| format!("\"{d}\"")).collect();
    format!(
        "version = \"1.0.0\"\ndependencies = [{}]\n\n[backend]\nbuiltin = \"recorder\"\n",
        deps.join(", ")
    )
}

/// A runtime over a temporary plugin root.
pub struct Harness {
    pub dir: TempDir,
    pub host: Arc<InMemoryHost>,
    pub probe: Arc<Probe>,
    pub runtime: Arc<PluginRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(adjust: impl FnOnce(&mut RuntimeSettings)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut settings = RuntimeSettings {
            plugins_dir: dir.path().join("plugins"),
            shared_dir: dir.path().join("uploads"),
            entry_timeout: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(2),
            ..RuntimeSettings::default()
        };
        adjust(&mut settings);
        std::fs::create_dir_all(&settings.plugins_dir).unwrap();

        let probe = Arc::new(Probe::default());
        let host = Arc::new(InMemoryHost::new());
        let runtime = PluginRuntime::new(
            settings,
            Arc::new(MemoryDocumentStore::new()),
            Arc::clone(&host) as _,
            Arc::new(recorder_resolver(&probe)),
        );
        Self {
            dir,
            host,
            probe,
            runtime,
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.runtime.settings().plugins_dir
    }

    pub fn add_recorder(&self, name: &str, dependencies: &[&str]) {
        write_plugin(self.plugins_dir(), name, &recorder_manifest(dependencies));
    }

    pub async fn count(&self, plugin: &str, kind: ActivityKind) -> usize {
        self.runtime
            .activity()
            .of_kind(plugin, kind)
            .await
            .unwrap()
            .len()
    }
}
