//! Filesystem watcher for the plugin root.
//!
//! Watches the plugin root recursively and turns raw `notify` events into
//! [`WatchEvent`]s:
//!
//! ```text
//! filesystem events (notify)
//!   → drop version-control and OS metadata paths
//!   → top-level directory appeared / vanished → PluginAdded / PluginRemoved
//!   → anything deeper → debounce per plugin
//!       → manifest touched → ManifestChanged (rediscover, then reload)
//!       → otherwise, blake3 source hash differs from cache → PluginChanged
//! ```
//!
//! [`spawn_watch_dispatcher`] applies the events to a [`PluginRuntime`].
//! Each event is handled on its own task; lifecycle operations serialize
//! per plugin inside the runtime.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checksum::{compute_source_hash, is_ignored_path};
use crate::error::{PluginError, PluginResult};
use crate::manifest::MANIFEST_FILE_NAME;
use crate::name::PluginName;
use crate::registry::scan_plugin_dirs;
use crate::runtime::PluginRuntime;

/// Default debounce interval for file change events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Events emitted by the plugin watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A new plugin directory appeared.
    PluginAdded {
        /// Directory name.
        name: PluginName,
    },
    /// A plugin directory was removed.
    PluginRemoved {
        /// Directory name.
        name: PluginName,
    },
    /// File contents inside a plugin changed.
    PluginChanged {
        /// Directory name.
        name: PluginName,
        /// blake3 hash of the plugin's tree after the change.
        source_hash: String,
    },
    /// The plugin's manifest was added or edited. Source changes settled
    /// in the same window are folded into this event.
    ManifestChanged {
        /// Directory name.
        name: PluginName,
    },
    /// Watcher encountered a non-fatal error.
    Error(String),
}

/// Configuration for the plugin watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// The plugin root.
    pub root: PathBuf,
    /// File changes within this window are coalesced.
    pub debounce: Duration,
}

impl WatcherConfig {
    /// Watch `root` with the default debounce.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Where a changed path sits relative to the plugin root.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathClass {
    /// The plugin directory itself.
    PluginDir(String),
    /// The plugin's manifest.
    Manifest(String),
    /// Any other path inside a plugin directory.
    Inside(String),
}

fn classify_path(root: &Path, path: &Path) -> Option<PathClass> {
    let relative = path.strip_prefix(root).ok()?;
    if is_ignored_path(relative) {
        return None;
    }
    let mut components = relative.components().filter_map(|c| match c {
        Component::Normal(part) => part.to_str(),
        _ => None,
    });
    let name = components.next()?.to_owned();
    let rest: Vec<&str> = components.collect();
    Some(match rest.as_slice() {
        [] => PathClass::PluginDir(name),
        [file] if *file == MANIFEST_FILE_NAME => PathClass::Manifest(name),
        _ => PathClass::Inside(name),
    })
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    deadline: tokio::time::Instant,
    manifest: bool,
}

/// Watches the plugin root and emits [`WatchEvent`]s.
pub struct PluginWatcher {
    config: WatcherConfig,
    /// Plugin directories known to exist.
    known: HashSet<String>,
    /// blake3 hash cache per plugin name.
    hash_cache: HashMap<String, String>,
    /// Dropping this stops filesystem monitoring.
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    event_tx: mpsc::Sender<WatchEvent>,
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher")
            .field("config", &self.config)
            .field("known", &self.known.len())
            .finish_non_exhaustive()
    }
}

impl PluginWatcher {
    /// Create a watcher and the receiver for its events.
    ///
    /// Call [`run`](Self::run) to start it.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Watcher`] if the OS watcher cannot be created.
    pub fn new(config: WatcherConfig) -> PluginResult<(Self, mpsc::Receiver<WatchEvent>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| PluginError::Watcher(e.to_string()))?;

        let root = config.root.canonicalize().unwrap_or_else(|_| config.root.clone());
        Ok((
            Self {
                config: WatcherConfig { root, ..config },
                known: HashSet::new(),
                hash_cache: HashMap::new(),
                watcher,
                raw_rx,
                event_tx,
            },
            event_rx,
        ))
    }

    /// Run the event loop until the event receiver is dropped or the OS
    /// watcher stops.
    pub async fn run(mut self) {
        let root = self.config.root.clone();
        if let Err(e) = self.watcher.watch(&root, RecursiveMode::Recursive) {
            warn!(path = %root.display(), error = %e, "Failed to watch plugin directory");
            let _ = self.event_tx.send(WatchEvent::Error(e.to_string())).await;
            return;
        }
        info!(path = %root.display(), "Watching plugin directory");
        self.prime().await;

        let debounce = self.config.debounce;
        let mut pending: HashMap<String, Pending> = HashMap::new();

        loop {
            let next_deadline = pending.values().map(|p| p.deadline).min();

            tokio::select! {
                biased;

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = tokio::time::Instant::now();
                    let ready: Vec<(String, Pending)> = pending
                        .iter()
                        .filter(|(_, p)| p.deadline <= now)
                        .map(|(name, p)| (name.clone(), *p))
                        .collect();
                    for (name, p) in ready {
                        pending.remove(&name);
                        if !self.settle(&name, p.manifest).await {
                            return;
                        }
                    }
                }

                event = self.raw_rx.recv() => {
                    match event {
                        Some(Ok(ev)) => {
                            if !self.handle_raw_event(&ev, &mut pending, debounce).await {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Filesystem watcher error");
                            if !self.emit(WatchEvent::Error(e.to_string())).await {
                                return;
                            }
                        }
                        None => {
                            debug!("Filesystem watcher channel closed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Record the plugins present at startup and their hashes.
    async fn prime(&mut self) {
        let (present, _) = scan_plugin_dirs(&self.config.root);
        for name in present {
            let dir = self.config.root.join(name.as_str());
            if let Ok(Ok(hash)) = tokio::task::spawn_blocking(move || compute_source_hash(&dir)).await {
                self.hash_cache.insert(name.to_string(), hash);
            }
            self.known.insert(name.to_string());
        }
        debug!(plugins = self.known.len(), "Watcher primed");
    }

    async fn emit(&self, event: WatchEvent) -> bool {
        if self.event_tx.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping watcher");
            return false;
        }
        true
    }

    /// Returns `false` when the receiver is gone.
    async fn handle_raw_event(
        &mut self,
        event: &Event,
        pending: &mut HashMap<String, Pending>,
        debounce: Duration,
    ) -> bool {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {},
            _ => return true,
        }

        for path in &event.paths {
            let Some(class) = classify_path(&self.config.root, path) else {
                continue;
            };
            let is_manifest = matches!(class, PathClass::Manifest(_));
            match class {
                PathClass::PluginDir(raw) => {
                    let Ok(name) = PluginName::new(raw.clone()) else {
                        debug!(dir = %raw, "Ignoring directory with invalid plugin name");
                        continue;
                    };
                    if path.is_dir() && self.known.insert(raw.clone()) {
                        info!(plugin = %name, "Plugin directory added");
                        if !self.emit(WatchEvent::PluginAdded { name }).await {
                            return false;
                        }
                    } else if !path.exists() && self.known.remove(&raw) {
                        pending.remove(&raw);
                        self.hash_cache.remove(&raw);
                        info!(plugin = %name, "Plugin directory removed");
                        if !self.emit(WatchEvent::PluginRemoved { name }).await {
                            return false;
                        }
                    }
                },
                PathClass::Manifest(name) | PathClass::Inside(name) => {
                    let manifest = is_manifest && path.exists();
                    debug!(path = %path.display(), plugin = %name, kind = ?event.kind, "File change detected");
                    #[allow(clippy::arithmetic_side_effects)]
                    // Instant + Duration cannot overflow in practice
                    let deadline = tokio::time::Instant::now() + debounce;
                    let entry = pending.entry(name).or_insert(Pending {
                        deadline,
                        manifest: false,
                    });
                    entry.deadline = deadline;
                    entry.manifest |= manifest;
                },
            }
        }
        true
    }

    /// Emit the debounced events for one plugin. Returns `false` when the
    /// receiver is gone.
    async fn settle(&mut self, raw: &str, manifest: bool) -> bool {
        let Ok(name) = PluginName::new(raw) else {
            return true;
        };
        let dir = self.config.root.join(raw);
        if !dir.is_dir() {
            return true;
        }

        let hash = match tokio::task::spawn_blocking(move || compute_source_hash(&dir)).await {
            Ok(Ok(hash)) => Some(hash),
            Ok(Err(e)) => {
                warn!(plugin = %name, error = %e, "Failed to hash plugin sources");
                if !manifest {
                    return self
                        .emit(WatchEvent::Error(format!("hash failed for {name}: {e}")))
                        .await;
                }
                None
            },
            Err(e) => {
                warn!(error = %e, "Hash task was cancelled");
                None
            },
        };

        let changed = hash.filter(|h| self.hash_cache.get(raw) != Some(h));
        if let Some(hash) = &changed {
            self.hash_cache.insert(raw.to_owned(), hash.clone());
        }

        // A manifest edit covers any source change settled with it; the
        // handler rediscovers before it reloads.
        if manifest {
            info!(plugin = %name, "Plugin manifest changed");
            return self.emit(WatchEvent::ManifestChanged { name }).await;
        }
        let Some(source_hash) = changed else {
            debug!(plugin = %name, "Source hash unchanged");
            return true;
        };

        info!(plugin = %name, hash = %source_hash, "Plugin sources changed");
        self.emit(WatchEvent::PluginChanged { name, source_hash })
            .await
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Aborts a spawned task when dropped.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `watcher` and apply its events to `runtime`.
///
/// Aborting the returned handle stops the watcher too.
#[must_use]
pub fn spawn_watch_dispatcher(
    runtime: Arc<PluginRuntime>,
    watcher: PluginWatcher,
    mut events: mpsc::Receiver<WatchEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _watcher = AbortOnDrop(tokio::spawn(watcher.run()));
        while let Some(event) = events.recv().await {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                if let Err(e) = handle_watch_event(&runtime, event).await {
                    warn!(error = %e, "Failed to apply watcher event");
                }
            });
        }
        debug!("Watcher event stream ended");
    })
}

/// Apply one watcher event.
///
/// # Errors
///
/// Returns the error of the registry or lifecycle operation it triggered.
pub async fn handle_watch_event(runtime: &PluginRuntime, event: WatchEvent) -> PluginResult<()> {
    match event {
        WatchEvent::PluginAdded { name } => {
            runtime.registry().discover(&name).await?;
        },
        WatchEvent::PluginRemoved { name } => {
            if runtime.is_loaded(name.as_str()) {
                runtime.unload_plugin(name.as_str()).await?;
            }
            if runtime.registry().get(name.as_str()).await?.is_some() {
                runtime.registry().mark_missing(name.as_str()).await?;
            }
        },
        WatchEvent::PluginChanged { name, .. } => {
            if runtime.is_loaded(name.as_str()) {
                runtime.reload_plugin(name.as_str()).await?;
            } else {
                debug!(plugin = %name, "Change in plugin that is not loaded");
            }
        },
        WatchEvent::ManifestChanged { name } => {
            runtime.registry().rediscover(&name).await?;
            if runtime.is_loaded(name.as_str()) {
                runtime.reload_plugin(name.as_str()).await?;
            }
        },
        WatchEvent::Error(message) => {
            warn!(error = %message, "Watcher reported an error");
        },
    }
    Ok(())
}
