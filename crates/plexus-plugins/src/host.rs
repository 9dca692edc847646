//! The host application contract.
//!
//! The runtime never owns HTTP routing or UI; it talks to the host through
//! [`HostApplication`]. Plugins see a narrower [`PluginHost`] during
//! registration, which runs every registration through the sandbox first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plexus_protocol::UiSlot;
use tracing::{debug, info};

use crate::error::{PluginError, PluginResult};
use crate::name::PluginName;
use crate::sandbox::{SandboxMediator, UiSurface};

/// An HTTP route registered by a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Owning plugin.
    pub plugin: PluginName,
    /// Upper-case HTTP method.
    pub method: String,
    /// Route path.
    pub path: String,
}

/// A UI extension registered by a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiExtension {
    /// Owning plugin.
    pub plugin: PluginName,
    /// Extension point.
    pub slot: UiSlot,
    /// Plugin-chosen id.
    pub id: String,
}

/// What the host publishes about a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Plugin version.
    pub version: String,
    /// When the instance was admitted.
    pub loaded_at: DateTime<Utc>,
    /// Worker process id for subprocess plugins.
    pub pid: Option<u32>,
}

/// Surfaces the runtime consumes from the host application.
#[async_trait]
pub trait HostApplication: Send + Sync {
    /// Register an HTTP route owned by `plugin`.
    async fn register_route(&self, plugin: &PluginName, method: &str, path: &str) -> PluginResult<()>;

    /// Register a UI extension owned by `plugin`.
    async fn register_ui(&self, plugin: &PluginName, slot: UiSlot, id: &str) -> PluginResult<()>;

    /// Drop every route and UI extension owned by `plugin`.
    async fn remove_plugin_surfaces(&self, plugin: &PluginName);

    /// Publish `plugin` in the host's named instance registry.
    async fn publish_instance(&self, plugin: &PluginName, info: InstanceInfo);

    /// Remove `plugin` from the host's named instance registry.
    async fn retract_instance(&self, plugin: &PluginName);

    /// Whether a request to `path` handled by `plugin` skips the global rate
    /// limit. Rate limiting itself is the host's business.
    fn bypasses_rate_limit(&self, _plugin: &PluginName, _path: &str) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// InMemoryHost
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HostState {
    routes: Vec<Route>,
    ui: Vec<UiExtension>,
    instances: BTreeMap<PluginName, InstanceInfo>,
}

/// A host that keeps routes, UI extensions and instances in memory.
///
/// Used by the daemon when no web host is attached, and by tests.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    state: RwLock<HostState>,
}

impl InMemoryHost {
    /// Create an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&HostState) -> T) -> T {
        let guard = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HostState) -> T) -> T {
        let mut guard = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Every registered route.
    #[must_use]
    pub fn routes(&self) -> Vec<Route> {
        self.read(|s| s.routes.clone())
    }

    /// Routes owned by one plugin.
    #[must_use]
    pub fn routes_for(&self, plugin: &str) -> Vec<Route> {
        self.read(|s| {
            s.routes
                .iter()
                .filter(|r| r.plugin.as_str() == plugin)
                .cloned()
                .collect()
        })
    }

    /// Every registered UI extension.
    #[must_use]
    pub fn ui_extensions(&self) -> Vec<UiExtension> {
        self.read(|s| s.ui.clone())
    }

    /// The named instance registry.
    #[must_use]
    pub fn instances(&self) -> BTreeMap<PluginName, InstanceInfo> {
        self.read(|s| s.instances.clone())
    }
}

#[async_trait]
impl HostApplication for InMemoryHost {
    async fn register_route(&self, plugin: &PluginName, method: &str, path: &str) -> PluginResult<()> {
        let method = method.to_ascii_uppercase();
        self.write(|s| {
            if let Some(existing) = s
                .routes
                .iter()
                .find(|r| r.method == method && r.path == path)
            {
                if &existing.plugin == plugin {
                    return Ok(());
                }
                return Err(PluginError::RouteConflict {
                    method: method.clone(),
                    path: path.to_owned(),
                    owner: existing.plugin.to_string(),
                });
            }
            s.routes.push(Route {
                plugin: plugin.clone(),
                method: method.clone(),
                path: path.to_owned(),
            });
            Ok(())
        })
    }

    async fn register_ui(&self, plugin: &PluginName, slot: UiSlot, id: &str) -> PluginResult<()> {
        self.write(|s| {
            let exists = s
                .ui
                .iter()
                .any(|u| &u.plugin == plugin && u.slot == slot && u.id == id);
            if !exists {
                s.ui.push(UiExtension {
                    plugin: plugin.clone(),
                    slot,
                    id: id.to_owned(),
                });
            }
        });
        Ok(())
    }

    async fn remove_plugin_surfaces(&self, plugin: &PluginName) {
        self.write(|s| {
            s.routes.retain(|r| &r.plugin != plugin);
            s.ui.retain(|u| &u.plugin != plugin);
        });
    }

    async fn publish_instance(&self, plugin: &PluginName, info: InstanceInfo) {
        self.write(|s| s.instances.insert(plugin.clone(), info));
    }

    async fn retract_instance(&self, plugin: &PluginName) {
        self.write(|s| s.instances.remove(plugin));
    }
}

// ---------------------------------------------------------------------------
// PluginHost
// ---------------------------------------------------------------------------

/// The registration surface a plugin sees in [`Plugin::register`].
///
/// [`Plugin::register`]: crate::plugin::Plugin::register
pub struct PluginHost {
    plugin: PluginName,
    host: Arc<dyn HostApplication>,
    mediator: Arc<SandboxMediator>,
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugin", &self.plugin)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    /// Create the surface for one plugin.
    #[must_use]
    pub fn new(plugin: PluginName, host: Arc<dyn HostApplication>, mediator: Arc<SandboxMediator>) -> Self {
        Self {
            plugin,
            host,
            mediator,
        }
    }

    /// The plugin being registered.
    #[must_use]
    pub fn plugin(&self) -> &PluginName {
        &self.plugin
    }

    /// Register an HTTP route.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PermissionDenied`] without `route_registration`,
    /// or the host's error (for example a route conflict).
    pub async fn register_route(&self, method: &str, path: &str) -> PluginResult<()> {
        let target = format!("{} {path}", method.to_ascii_uppercase());
        if !self
            .mediator
            .check_ui(&self.plugin, UiSurface::Route, &target)
            .await
        {
            return Err(PluginError::PermissionDenied {
                plugin: self.plugin.to_string(),
                resource: format!("route {target}"),
            });
        }
        self.host.register_route(&self.plugin, method, path).await?;
        info!(plugin = %self.plugin, route = %target, "Route registered");
        Ok(())
    }

    /// Register a UI extension.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PermissionDenied`] without the matching UI
    /// grant, or the host's error.
    pub async fn register_ui(&self, slot: UiSlot, id: &str) -> PluginResult<()> {
        let target = format!("{slot:?}:{id}");
        if !self
            .mediator
            .check_ui(&self.plugin, UiSurface::from(slot), &target)
            .await
        {
            return Err(PluginError::PermissionDenied {
                plugin: self.plugin.to_string(),
                resource: format!("ui {target}"),
            });
        }
        self.host.register_ui(&self.plugin, slot, id).await?;
        debug!(plugin = %self.plugin, ui = %target, "UI extension registered");
        Ok(())
    }

    /// Whether the host exempts this plugin's `path` from rate limiting.
    #[must_use]
    pub fn bypasses_rate_limit(&self, path: &str) -> bool {
        self.host.bypasses_rate_limit(&self.plugin, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_conflict_across_plugins_only() {
        let host = InMemoryHost::new();
        let billing = PluginName::new("billing").unwrap();
        let seo = PluginName::new("seo").unwrap();

        host.register_route(&billing, "get", "/invoices").await.unwrap();
        host.register_route(&billing, "GET", "/invoices").await.unwrap();
        assert_eq!(host.routes().len(), 1);

        let err = host.register_route(&seo, "GET", "/invoices").await.unwrap_err();
        assert!(matches!(err, PluginError::RouteConflict { ref owner, .. } if owner == "billing"));

        host.remove_plugin_surfaces(&billing).await;
        host.register_route(&seo, "GET", "/invoices").await.unwrap();
        assert_eq!(host.routes_for("seo").len(), 1);
    }

    #[tokio::test]
    async fn instances_publish_and_retract() {
        let host = InMemoryHost::new();
        let billing = PluginName::new("billing").unwrap();
        host.publish_instance(
            &billing,
            InstanceInfo {
                version: "1.0.0".into(),
                loaded_at: Utc::now(),
                pid: None,
            },
        )
        .await;
        assert!(host.instances().contains_key(&billing));
        assert!(!host.bypasses_rate_limit(&billing, "/invoices"));

        host.retract_instance(&billing).await;
        assert!(host.instances().is_empty());
    }
}
