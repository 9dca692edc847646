//! Capability tables compiled from plugin permissions.
//!
//! A [`CapabilityTable`] maps `(resource kind, resource scope)` to the
//! operations a plugin may perform there. The sandbox classifies each
//! request into a scope first and then does a single table lookup, so the
//! permission rules live in one place ([`CapabilityTable::compile`]) instead
//! of being re-derived per check.

use std::collections::HashMap;
use std::fmt;

use crate::name::PluginName;
use crate::record::Permissions;

/// What kind of resource is being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A filesystem path.
    File,
    /// A data-store collection.
    Collection,
    /// An outbound network channel.
    Network,
    /// A host UI surface.
    Ui,
}

/// Which region of a resource kind the access falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceScope {
    /// The plugin's own directory or `plugin_<name>_*` collections.
    Own,
    /// The shared uploads directory.
    Shared,
    /// A core collection from the allow-list.
    Core,
    /// Outbound HTTP(S).
    Http,
    /// Outbound websockets.
    Websocket,
    /// Outgoing email.
    Email,
    /// HTTP route registration.
    Route,
    /// Administration panel pages.
    AdminPanel,
    /// User-facing overlays.
    UserOverlay,
}

/// A single operation on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read access.
    Read,
    /// Write access.
    Write,
    /// Use of a channel or surface.
    Use,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Use => "use",
        })
    }
}

/// The set of operations granted on one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationSet {
    read: bool,
    write: bool,
    use_: bool,
}

impl OperationSet {
    fn with(mut self, op: Operation, granted: bool) -> Self {
        match op {
            Operation::Read => self.read |= granted,
            Operation::Write => self.write |= granted,
            Operation::Use => self.use_ |= granted,
        }
        self
    }

    /// Whether `op` is granted.
    #[must_use]
    pub fn contains(self, op: Operation) -> bool {
        match op {
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Use => self.use_,
        }
    }

    /// Whether nothing is granted.
    #[must_use]
    pub fn is_empty(self) -> bool {
        !(self.read || self.write || self.use_)
    }
}

/// Compiled permissions for one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityTable {
    plugin: PluginName,
    grants: HashMap<(ResourceKind, ResourceScope), OperationSet>,
}

impl CapabilityTable {
    /// Compile a plugin's permission record.
    ///
    /// Writing core collections needs both `read_core` and `write_core`.
    #[must_use]
    pub fn compile(plugin: PluginName, permissions: &Permissions) -> Self {
        use Operation::{Read, Use, Write};
        use ResourceKind::{Collection, File, Network, Ui};
        use ResourceScope::{AdminPanel, Core, Email, Http, Own, Route, Shared, UserOverlay, Websocket};

        let fs = &permissions.filesystem;
        let ds = &permissions.data_store;
        let net = &permissions.network;
        let ui = &permissions.ui;
        let none = OperationSet::default();

        let entries = [
            ((File, Own), none.with(Read, fs.read_own).with(Write, fs.write_own)),
            ((File, Shared), none.with(Read, fs.read_shared).with(Write, fs.write_shared)),
            ((Collection, Own), none.with(Read, ds.read_own).with(Write, ds.write_own)),
            (
                (Collection, Core),
                none.with(Read, ds.read_core)
                    .with(Write, ds.read_core && ds.write_core),
            ),
            ((Network, Http), none.with(Use, net.http_requests)),
            ((Network, Websocket), none.with(Use, net.websockets)),
            ((Network, Email), none.with(Use, net.email_sending)),
            ((Ui, Route), none.with(Use, ui.route_registration)),
            ((Ui, AdminPanel), none.with(Use, ui.admin_panel)),
            ((Ui, UserOverlay), none.with(Use, ui.user_overlay)),
        ];

        Self {
            plugin,
            grants: entries
                .into_iter()
                .filter(|(_, ops)| !ops.is_empty())
                .collect(),
        }
    }

    /// The plugin this table belongs to.
    #[must_use]
    pub fn plugin(&self) -> &PluginName {
        &self.plugin
    }

    /// Operations granted on a scope.
    #[must_use]
    pub fn operations(&self, kind: ResourceKind, scope: ResourceScope) -> OperationSet {
        self.grants.get(&(kind, scope)).copied().unwrap_or_default()
    }

    /// Whether `op` is allowed on `(kind, scope)`.
    #[must_use]
    pub fn allows(&self, kind: ResourceKind, scope: ResourceScope, op: Operation) -> bool {
        self.operations(kind, scope).contains(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataStorePermissions, FilesystemPermissions};

    fn table(permissions: &Permissions) -> CapabilityTable {
        CapabilityTable::compile(PluginName::new("billing").unwrap(), permissions)
    }

    #[test]
    fn read_own_only_grants_nothing_else_on_files() {
        let permissions = Permissions {
            filesystem: FilesystemPermissions {
                read_own: true,
                write_own: false,
                read_shared: false,
                write_shared: false,
            },
            ..Permissions::default()
        };
        let t = table(&permissions);
        assert!(t.allows(ResourceKind::File, ResourceScope::Own, Operation::Read));
        assert!(!t.allows(ResourceKind::File, ResourceScope::Own, Operation::Write));
        assert!(!t.allows(ResourceKind::File, ResourceScope::Shared, Operation::Read));
        assert!(!t.allows(ResourceKind::File, ResourceScope::Shared, Operation::Write));
    }

    #[test]
    fn core_write_requires_read_and_write() {
        let write_only = Permissions {
            data_store: DataStorePermissions {
                read_core: false,
                write_core: true,
                ..DataStorePermissions::default()
            },
            ..Permissions::default()
        };
        assert!(!table(&write_only).allows(
            ResourceKind::Collection,
            ResourceScope::Core,
            Operation::Write
        ));

        let both = Permissions {
            data_store: DataStorePermissions {
                read_core: true,
                write_core: true,
                ..DataStorePermissions::default()
            },
            ..Permissions::default()
        };
        let t = table(&both);
        assert!(t.allows(ResourceKind::Collection, ResourceScope::Core, Operation::Read));
        assert!(t.allows(ResourceKind::Collection, ResourceScope::Core, Operation::Write));
    }

    #[test]
    fn network_defaults_to_denied() {
        let t = table(&Permissions::default());
        assert!(!t.allows(ResourceKind::Network, ResourceScope::Http, Operation::Use));
        assert!(t.allows(ResourceKind::Ui, ResourceScope::Route, Operation::Use));
        assert!(t.operations(ResourceKind::Ui, ResourceScope::AdminPanel).is_empty());
    }
}
