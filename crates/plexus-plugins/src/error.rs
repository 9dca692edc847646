//! Plugin runtime error types.

use std::path::PathBuf;

/// Errors from plugin runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// No registry record and no plugin directory exist for this name.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// The plugin name is malformed.
    #[error("invalid plugin name: {0}")]
    InvalidName(String),

    /// Failed to parse a `plugin.toml` manifest.
    #[error("manifest parse error in {path}: {message}")]
    ManifestParse {
        /// Path to the manifest file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// A declared dependency is not active and enabled.
    #[error("dependency not satisfied for {plugin}: {dependency} is {reason}")]
    DependencyNotSatisfied {
        /// The plugin being loaded.
        plugin: String,
        /// The dependency that blocked it.
        dependency: String,
        /// What is wrong with the dependency.
        reason: String,
    },

    /// The plugin's entry point or registration hook failed.
    #[error("entry point failed for {plugin}: {message}")]
    EntryPointFailed {
        /// The failing plugin.
        plugin: String,
        /// Failure reason.
        message: String,
    },

    /// Plugin-supplied code did not finish in time.
    #[error("{operation} for {plugin} timed out after {secs}s")]
    Timeout {
        /// The plugin that hung.
        plugin: String,
        /// Which call timed out.
        operation: &'static str,
        /// The bound that was exceeded.
        secs: u64,
    },

    /// Expected plugin files are missing or unreadable.
    #[error("integrity check failed for {plugin}: {message}")]
    IntegrityFailed {
        /// The plugin that failed verification.
        plugin: String,
        /// What was missing.
        message: String,
    },

    /// The manifest declares no backend to run.
    #[error("plugin {0} has no backend entry point")]
    MissingEntryPoint(String),

    /// The manifest names an in-process factory that is not registered.
    #[error("plugin {plugin} names unknown builtin factory '{factory}'")]
    UnknownFactory {
        /// The plugin.
        plugin: String,
        /// The factory name from the manifest.
        factory: String,
    },

    /// The sandbox refused an access made through a checked helper.
    #[error("permission denied for {plugin}: {resource}")]
    PermissionDenied {
        /// The plugin that was refused.
        plugin: String,
        /// Description of the refused resource and operation.
        resource: String,
    },

    /// Another plugin already owns this route.
    #[error("route {method} {path} is already registered by {owner}")]
    RouteConflict {
        /// HTTP method.
        method: String,
        /// Route path.
        path: String,
        /// Plugin that owns the route.
        owner: String,
    },

    /// A subprocess worker broke the wire protocol.
    #[error("protocol error from {plugin}: {message}")]
    Protocol {
        /// The plugin whose worker misbehaved.
        plugin: String,
        /// What went wrong.
        message: String,
    },

    /// A plugin's health check reported failure.
    #[error("health check failed for {plugin}: {message}")]
    HealthCheckFailed {
        /// The unhealthy plugin.
        plugin: String,
        /// Failure reason.
        message: String,
    },

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The filesystem watcher could not be started.
    #[error("watcher error: {0}")]
    Watcher(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<plexus_storage::StorageError> for PluginError {
    fn from(e: plexus_storage::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type for plugin runtime operations.
pub type PluginResult<T> = Result<T, PluginError>;
