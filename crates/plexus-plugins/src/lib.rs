//! Plugin runtime for Plexus.
//!
//! Plugins are directories under a plugin root, each described by a
//! `plugin.toml` manifest. This crate discovers them, keeps their records in
//! a document store, and admits them into a running host application:
//!
//! - [`PluginRegistry`]: persistent records, discovery, error and health bookkeeping
//! - [`SandboxMediator`] / [`PluginSandbox`]: permission checks on every resource access
//! - [`PluginRuntime`]: the loaded-set, with load, unload and reload in dependency order
//! - [`RollbackController`]: last known-good instance per plugin
//! - [`HealthMonitor`]: periodic sampling and corrective reloads
//! - [`PluginWatcher`]: hot reload from filesystem changes
//!
//! # Entry points
//!
//! A plugin's backend is either a builtin factory compiled into the host or
//! a worker process speaking the line-delimited JSON protocol from
//! `plexus-protocol`. [`StandardResolver`] handles both.
//!
//! # Isolation
//!
//! Plugins never touch shared state directly. Files, collections, network
//! hosts and UI surfaces go through the sandbox, which consults the
//! plugin's declared permissions and logs every denial.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod activity;
pub mod capability;
pub mod checksum;
pub mod error;
pub mod health;
pub mod host;
pub mod loader;
mod locks;
pub mod manifest;
pub mod name;
pub mod plugin;
pub mod process;
pub mod record;
pub mod registry;
pub mod rollback;
pub mod runtime;
pub mod sandbox;
#[cfg(feature = "watch")]
pub mod watcher;

pub use activity::{
    ActivityCategory, ActivityKind, ActivityLog, ActivityRecord, ActivityStatus, Severity,
};
pub use capability::{CapabilityTable, Operation, OperationSet, ResourceKind, ResourceScope};
pub use checksum::compute_source_hash;
pub use error::{PluginError, PluginResult};
pub use health::{
    HealthMonitor, HealthReport, PluginSample, ResourceSample, ResourceSampler, SysinfoSampler,
};
pub use host::{HostApplication, InMemoryHost, InstanceInfo, PluginHost, Route, UiExtension};
pub use loader::{BulkLoadReport, FailedLoad, LoadOptions, Unresolved, UnresolvedReason};
pub use manifest::{MANIFEST_FILE_NAME, PluginManifest, load_manifest};
pub use name::PluginName;
pub use plugin::{
    EntryPoint, EntryPointResolver, Plugin, PluginContext, PluginFactory, StandardResolver,
};
pub use process::ProcessPlugin;
pub use record::{
    HealthLevel, HealthMetrics, HealthThresholds, PluginRecord, PluginState, Permissions,
};
pub use registry::{ErrorRecorded, PluginRegistry, SyncReport};
pub use rollback::{RollbackController, RollbackOutcome, RollbackPoint};
pub use runtime::{LoadedPlugin, PluginRuntime, RuntimeSettings};
pub use sandbox::{AccessMode, PluginSandbox, SandboxMediator, SandboxSettings, UiSurface};
#[cfg(feature = "watch")]
pub use watcher::{
    PluginWatcher, WatchEvent, WatcherConfig, handle_watch_event, spawn_watch_dispatcher,
};
