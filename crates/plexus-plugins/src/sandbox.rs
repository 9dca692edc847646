//! Sandbox mediator: per-plugin capability checks with an access log.
//!
//! Every check reads the plugin's current registry row, so a permission
//! change takes effect on the very next call. The compiled
//! [`CapabilityTable`] is cached per plugin and rebuilt only when the row's
//! permissions differ from the ones it was compiled from.
//!
//! Every decision is written to the activity log: allowed accesses as
//! `*_access` rows, denials as `permission_violation` at high severity.
//! A denial is a `false`, never an error; the calling plugin decides what
//! to do about it.
//!
//! Enforcement is advisory. Plugins that go through [`PluginSandbox`] or
//! the worker protocol are mediated; nothing stops in-process code from
//! calling the OS directly.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use plexus_protocol::{NetworkChannel, UiSlot};
use plexus_storage::{DocumentStore, Query};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::activity::{ActivityKind, ActivityLog, ActivityRecord};
use crate::capability::{CapabilityTable, Operation, ResourceKind, ResourceScope};
use crate::error::{PluginError, PluginResult};
use crate::name::PluginName;
use crate::record::{Permissions, PluginRecord};
use crate::registry::PluginRegistry;

/// Read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read access.
    Read,
    /// Write access.
    Write,
}

impl AccessMode {
    fn operation(self) -> Operation {
        match self {
            Self::Read => Operation::Read,
            Self::Write => Operation::Write,
        }
    }

    /// Map a protocol `write` flag.
    #[must_use]
    pub fn from_write(write: bool) -> Self {
        if write { Self::Write } else { Self::Read }
    }
}

/// Host UI surfaces a plugin can extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiSurface {
    /// HTTP route registration.
    Route,
    /// Administration panel page.
    AdminPanel,
    /// User-facing overlay.
    UserOverlay,
}

impl From<UiSlot> for UiSurface {
    fn from(slot: UiSlot) -> Self {
        match slot {
            UiSlot::AdminPanel => Self::AdminPanel,
            UiSlot::UserOverlay => Self::UserOverlay,
        }
    }
}

/// Inputs the mediator needs from configuration.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Shared uploads directory.
    pub shared_dir: PathBuf,
    /// Collections reachable with `read_core`/`write_core`.
    pub core_collections: Vec<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            shared_dir: PathBuf::from("uploads"),
            core_collections: ["users", "settings", "pages", "media"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

type CachedTable = (Permissions, Arc<CapabilityTable>);

/// The sandbox mediator.
pub struct SandboxMediator {
    registry: Arc<PluginRegistry>,
    activity: ActivityLog,
    store: Arc<dyn DocumentStore>,
    shared_dir: PathBuf,
    core_collections: BTreeSet<String>,
    tables: DashMap<PluginName, CachedTable>,
}

impl fmt::Debug for SandboxMediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxMediator")
            .field("shared_dir", &self.shared_dir)
            .field("core_collections", &self.core_collections)
            .finish_non_exhaustive()
    }
}

impl SandboxMediator {
    /// Create a mediator.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        activity: ActivityLog,
        store: Arc<dyn DocumentStore>,
        settings: SandboxSettings,
    ) -> Self {
        let shared_dir = std::path::absolute(&settings.shared_dir).unwrap_or(settings.shared_dir);
        Self {
            registry,
            activity,
            store,
            shared_dir,
            core_collections: settings.core_collections.into_iter().collect(),
            tables: DashMap::new(),
        }
    }

    /// The shared uploads directory.
    #[must_use]
    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// A scoped handle for one plugin.
    #[must_use]
    pub fn sandbox_for(self: &Arc<Self>, plugin: PluginName, plugin_dir: PathBuf) -> PluginSandbox {
        PluginSandbox {
            plugin,
            plugin_dir,
            mediator: Arc::clone(self),
        }
    }

    /// Current record and compiled table for a plugin.
    async fn lookup(&self, plugin: &PluginName) -> Option<(PluginRecord, Arc<CapabilityTable>)> {
        let record = match self.registry.get(plugin.as_str()).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "Registry lookup failed during access check");
                return None;
            },
        };

        if let Some(cached) = self.tables.get(plugin)
            && cached.0 == record.permissions
        {
            return Some((record, Arc::clone(&cached.1)));
        }

        let table = Arc::new(CapabilityTable::compile(plugin.clone(), &record.permissions));
        debug!(plugin = %plugin, "Compiled capability table");
        self.tables
            .insert(plugin.clone(), (record.permissions, Arc::clone(&table)));
        Some((record, table))
    }

    /// Look up, decide and log.
    async fn decide<F>(
        &self,
        plugin: &PluginName,
        kind: ResourceKind,
        op: Operation,
        resource: String,
        classify: F,
    ) -> bool
    where
        F: FnOnce(&PluginRecord) -> Option<ResourceScope> + Send,
    {
        let (allowed, reason) = match self.lookup(plugin).await {
            None => (false, "unknown plugin"),
            Some((record, table)) => match classify(&record) {
                None => (false, "outside every permitted scope"),
                Some(scope) if table.allows(kind, scope, op) => (true, "granted"),
                Some(_) => (false, "permission not granted"),
            },
        };
        self.log_decision(plugin, kind, op, &resource, allowed, reason)
            .await;
        allowed
    }

    async fn log_decision(
        &self,
        plugin: &PluginName,
        kind: ResourceKind,
        op: Operation,
        resource: &str,
        allowed: bool,
        reason: &str,
    ) {
        let details = json!({
            "resource": resource,
            "operation": op.to_string(),
            "reason": reason,
        });
        let record = if allowed {
            debug!(plugin = %plugin, resource = %resource, operation = %op, "Access allowed");
            let kind = match kind {
                ResourceKind::File => ActivityKind::FileAccess,
                ResourceKind::Collection => ActivityKind::DataAccess,
                ResourceKind::Network => ActivityKind::NetworkAccess,
                ResourceKind::Ui => ActivityKind::UiAccess,
            };
            ActivityRecord::new(plugin.as_str(), kind, format!("{op} {resource}"))
        } else {
            warn!(
                plugin = %plugin,
                resource = %resource,
                operation = %op,
                reason = %reason,
                "Access denied"
            );
            ActivityRecord::new(
                plugin.as_str(),
                ActivityKind::PermissionViolation,
                format!("Denied {op} {resource}"),
            )
            .failure()
        };
        self.activity.record(record.details(details)).await;
    }

    // -----------------------------------------------------------------------
    // Checks
    // -----------------------------------------------------------------------

    /// Check a filesystem access.
    ///
    /// Relative paths resolve against the plugin's directory. Paths are
    /// normalized and symlinks in existing prefixes are resolved before the
    /// containment test. Anything outside the plugin's own directory and
    /// the shared directory is denied.
    pub async fn check_file(&self, plugin: &PluginName, path: &Path, mode: AccessMode) -> bool {
        let shared = resolve_path(&self.shared_dir);
        let display = path.display().to_string();
        let path = path.to_path_buf();
        self.decide(plugin, ResourceKind::File, mode.operation(), display, move |record| {
            let own = resolve_path(&record.plugin_dir);
            let target = resolve_path(&record.plugin_dir.join(&path));
            if target.starts_with(&own) {
                Some(ResourceScope::Own)
            } else if target.starts_with(&shared) {
                Some(ResourceScope::Shared)
            } else {
                None
            }
        })
        .await
    }

    /// Check a data-store access.
    ///
    /// `plugin_<name>_<suffix>` collections (non-empty suffix) are the
    /// plugin's own. Collections on the core allow-list are core. Everything
    /// else is denied.
    pub async fn check_collection(&self, plugin: &PluginName, collection: &str, mode: AccessMode) -> bool {
        let scope = self.classify_collection(plugin, collection);
        self.decide(
            plugin,
            ResourceKind::Collection,
            mode.operation(),
            format!("collection:{collection}"),
            move |_| scope,
        )
        .await
    }

    /// Scope of a collection for a plugin, if it has one.
    #[must_use]
    pub fn classify_collection(&self, plugin: &PluginName, collection: &str) -> Option<ResourceScope> {
        let prefix = plugin.collection_prefix();
        match collection.strip_prefix(&prefix) {
            Some(suffix) if !suffix.is_empty() => Some(ResourceScope::Own),
            _ if self.core_collections.contains(collection) => Some(ResourceScope::Core),
            _ => None,
        }
    }

    /// Check an outbound network access.
    pub async fn check_network(&self, plugin: &PluginName, url: &str, channel: NetworkChannel) -> bool {
        let scope = match channel {
            NetworkChannel::Http => ResourceScope::Http,
            NetworkChannel::Websocket => ResourceScope::Websocket,
            NetworkChannel::Email => ResourceScope::Email,
        };
        self.decide(
            plugin,
            ResourceKind::Network,
            Operation::Use,
            url.to_owned(),
            move |_| Some(scope),
        )
        .await
    }

    /// Check a UI registration.
    pub async fn check_ui(&self, plugin: &PluginName, surface: UiSurface, target: &str) -> bool {
        let scope = match surface {
            UiSurface::Route => ResourceScope::Route,
            UiSurface::AdminPanel => ResourceScope::AdminPanel,
            UiSurface::UserOverlay => ResourceScope::UserOverlay,
        };
        self.decide(
            plugin,
            ResourceKind::Ui,
            Operation::Use,
            target.to_owned(),
            move |_| Some(scope),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// PluginSandbox
// ---------------------------------------------------------------------------

/// Mediated resource access for one plugin instance.
///
/// Attached to every instance during load. The checked helpers turn a
/// denial into [`PluginError::PermissionDenied`] so plugin code can use `?`.
#[derive(Clone)]
pub struct PluginSandbox {
    plugin: PluginName,
    plugin_dir: PathBuf,
    mediator: Arc<SandboxMediator>,
}

impl fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("plugin", &self.plugin)
            .field("plugin_dir", &self.plugin_dir)
            .finish_non_exhaustive()
    }
}

impl PluginSandbox {
    /// The plugin this handle belongs to.
    #[must_use]
    pub fn plugin(&self) -> &PluginName {
        &self.plugin
    }

    /// The plugin's directory.
    #[must_use]
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Full name of one of the plugin's own collections.
    #[must_use]
    pub fn own_collection(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.plugin.collection_prefix())
    }

    /// Check a filesystem access without performing it.
    pub async fn check_file(&self, path: &Path, mode: AccessMode) -> bool {
        self.mediator.check_file(&self.plugin, path, mode).await
    }

    /// Check a data-store access without performing it.
    pub async fn check_collection(&self, collection: &str, mode: AccessMode) -> bool {
        self.mediator
            .check_collection(&self.plugin, collection, mode)
            .await
    }

    /// Check an outbound network access.
    pub async fn check_network(&self, url: &str, channel: NetworkChannel) -> bool {
        self.mediator.check_network(&self.plugin, url, channel).await
    }

    fn denied(&self, resource: String) -> PluginError {
        PluginError::PermissionDenied {
            plugin: self.plugin.to_string(),
            resource,
        }
    }

    /// Read a file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PermissionDenied`] on denial, or the I/O error.
    pub async fn read_file(&self, path: impl AsRef<Path>) -> PluginResult<Vec<u8>> {
        let path = self.plugin_dir.join(path.as_ref());
        if !self.check_file(&path, AccessMode::Read).await {
            return Err(self.denied(format!("read {}", path.display())));
        }
        Ok(tokio::fs::read(&path).await?)
    }

    /// Write a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PermissionDenied`] on denial, or the I/O error.
    pub async fn write_file(&self, path: impl AsRef<Path>, contents: &[u8]) -> PluginResult<()> {
        let path = self.plugin_dir.join(path.as_ref());
        if !self.check_file(&path, AccessMode::Write).await {
            return Err(self.denied(format!("write {}", path.display())));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }

    /// Fetch a document.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PermissionDenied`] on denial, or the store error.
    pub async fn get_document(&self, collection: &str, id: &str) -> PluginResult<Option<Value>> {
        if !self.check_collection(collection, AccessMode::Read).await {
            return Err(self.denied(format!("read collection:{collection}")));
        }
        Ok(self.mediator.store.get(collection, id).await?)
    }

    /// Query documents.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PermissionDenied`] on denial, or the store error.
    pub async fn find_documents(&self, collection: &str, query: &Query) -> PluginResult<Vec<Value>> {
        if !self.check_collection(collection, AccessMode::Read).await {
            return Err(self.denied(format!("read collection:{collection}")));
        }
        Ok(self.mediator.store.find(collection, query).await?)
    }

    /// Insert or replace a document.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PermissionDenied`] on denial, or the store error.
    pub async fn put_document(&self, collection: &str, id: &str, document: Value) -> PluginResult<()> {
        if !self.check_collection(collection, AccessMode::Write).await {
            return Err(self.denied(format!("write collection:{collection}")));
        }
        Ok(self.mediator.store.upsert(collection, id, document).await?)
    }
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Remove `.` and resolve `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                out.pop();
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Normalize `path` and canonicalize its longest existing prefix.
///
/// Resolving the existing prefix catches symlinks that point out of a
/// plugin directory; the lexical pass handles paths that do not exist yet.
fn resolve_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.as_path();
    let mut tail: Vec<OsString> = Vec::new();
    loop {
        if let Ok(mut resolved) = existing.canonicalize() {
            for part in tail.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            },
            _ => return normalized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FilesystemPermissions;
    use crate::registry::RegistrySettings;
    use crate::activity::Severity;
    use plexus_storage::MemoryDocumentStore;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        registry: Arc<PluginRegistry>,
        activity: ActivityLog,
        mediator: Arc<SandboxMediator>,
        name: PluginName,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let plugins = root.join("plugins");
        std::fs::create_dir_all(plugins.join("billing")).unwrap();
        std::fs::create_dir_all(root.join("uploads")).unwrap();

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let activity = ActivityLog::new(Arc::clone(&store), 90);
        let registry = Arc::new(PluginRegistry::new(
            Arc::clone(&store),
            activity.clone(),
            RegistrySettings {
                plugins_dir: plugins,
                ..RegistrySettings::default()
            },
        ));
        let name = PluginName::new("billing").unwrap();
        registry.discover(&name).await.unwrap();

        let mediator = Arc::new(SandboxMediator::new(
            Arc::clone(&registry),
            activity.clone(),
            store,
            SandboxSettings {
                shared_dir: root.join("uploads"),
                ..SandboxSettings::default()
            },
        ));
        Fixture {
            _tmp: tmp,
            root,
            registry,
            activity,
            mediator,
            name,
        }
    }

    async fn set_fs(f: &Fixture, fs: FilesystemPermissions) {
        f.registry
            .modify("billing", |r| r.permissions.filesystem = fs)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn read_own_only_denies_writes_and_shared() {
        let f = fixture().await;
        set_fs(
            &f,
            FilesystemPermissions {
                read_own: true,
                write_own: false,
                read_shared: false,
                write_shared: false,
            },
        )
        .await;

        let own = f.root.join("plugins/billing/data.json");
        let shared = f.root.join("uploads/logo.png");
        assert!(f.mediator.check_file(&f.name, &own, AccessMode::Read).await);
        assert!(!f.mediator.check_file(&f.name, &own, AccessMode::Write).await);
        assert!(!f.mediator.check_file(&f.name, &shared, AccessMode::Read).await);
        assert!(!f.mediator.check_file(&f.name, &shared, AccessMode::Write).await);

        let violations = f
            .activity
            .of_kind("billing", ActivityKind::PermissionViolation)
            .await
            .unwrap();
        assert_eq!(violations.len(), 3);
        assert!(violations.iter().all(|v| v.severity == Severity::High));
        let allowed = f
            .activity
            .of_kind("billing", ActivityKind::FileAccess)
            .await
            .unwrap();
        assert_eq!(allowed.len(), 1);
    }

    #[tokio::test]
    async fn traversal_and_foreign_paths_are_denied() {
        let f = fixture().await;
        let escape = Path::new("../other/secret.txt");
        assert!(!f.mediator.check_file(&f.name, escape, AccessMode::Read).await);
        assert!(!f.mediator.check_file(&f.name, Path::new("/etc/passwd"), AccessMode::Read).await);
        // Relative paths inside the plugin resolve against its directory.
        assert!(f.mediator.check_file(&f.name, Path::new("./cache/x"), AccessMode::Write).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_plugin_dir_is_denied() {
        let f = fixture().await;
        std::os::unix::fs::symlink(
            f.root.join("uploads"),
            f.root.join("plugins/billing/link"),
        )
        .unwrap();
        let through_link = f.root.join("plugins/billing/link/file.txt");
        assert!(!f.mediator.check_file(&f.name, &through_link, AccessMode::Read).await);
    }

    #[tokio::test]
    async fn permission_changes_apply_to_next_check() {
        let f = fixture().await;
        let shared = f.root.join("uploads/logo.png");
        assert!(!f.mediator.check_file(&f.name, &shared, AccessMode::Read).await);

        set_fs(
            &f,
            FilesystemPermissions {
                read_shared: true,
                ..FilesystemPermissions::default()
            },
        )
        .await;
        assert!(f.mediator.check_file(&f.name, &shared, AccessMode::Read).await);
        assert!(!f.mediator.check_file(&f.name, &shared, AccessMode::Write).await);
    }

    #[tokio::test]
    async fn collections_are_namespaced() {
        let f = fixture().await;
        let m = &f.mediator;
        assert!(m.check_collection(&f.name, "plugin_billing_invoices", AccessMode::Write).await);
        assert!(!m.check_collection(&f.name, "plugin_billing_", AccessMode::Read).await);
        assert!(!m.check_collection(&f.name, "plugin_seo_pages", AccessMode::Read).await);
        assert!(!m.check_collection(&f.name, "users", AccessMode::Read).await);
        assert!(!m.check_collection(&f.name, "sessions", AccessMode::Read).await);

        f.registry
            .modify("billing", |r| r.permissions.data_store.read_core = true)
            .await
            .unwrap();
        assert!(m.check_collection(&f.name, "users", AccessMode::Read).await);
        assert!(!m.check_collection(&f.name, "users", AccessMode::Write).await);
    }

    #[tokio::test]
    async fn network_requires_http_grant() {
        let f = fixture().await;
        let url = "https://api.example.com/v1";
        assert!(!f.mediator.check_network(&f.name, url, NetworkChannel::Http).await);
        f.registry
            .modify("billing", |r| r.permissions.network.http_requests = true)
            .await
            .unwrap();
        assert!(f.mediator.check_network(&f.name, url, NetworkChannel::Http).await);
        assert!(!f.mediator.check_network(&f.name, url, NetworkChannel::Email).await);
    }

    #[tokio::test]
    async fn unknown_plugin_is_denied() {
        let f = fixture().await;
        let ghost = PluginName::new("ghost").unwrap();
        assert!(!f.mediator.check_network(&ghost, "https://x", NetworkChannel::Http).await);
        assert!(!f.mediator.check_ui(&ghost, UiSurface::Route, "GET /x").await);
    }

    #[tokio::test]
    async fn sandbox_handle_maps_denials_to_errors() {
        let f = fixture().await;
        let sandbox = f
            .mediator
            .sandbox_for(f.name.clone(), f.root.join("plugins/billing"));

        sandbox.write_file("state/counter", b"1").await.unwrap();
        assert_eq!(sandbox.read_file("state/counter").await.unwrap(), b"1");

        let err = sandbox.read_file("../../uploads/x").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));

        let collection = sandbox.own_collection("invoices");
        sandbox
            .put_document(&collection, "inv-1", json!({"total": 10}))
            .await
            .unwrap();
        let doc = sandbox.get_document(&collection, "inv-1").await.unwrap();
        assert_eq!(doc.unwrap()["total"], 10);

        let err = sandbox.get_document("users", "u1").await.unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied { .. }));
    }
}
