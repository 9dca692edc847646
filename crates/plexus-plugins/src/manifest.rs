//! Plugin manifest (`plugin.toml`) parsing.
//!
//! Every field is optional. A plugin directory without a manifest is still
//! discoverable; it just has no backend to run until one is added.
//!
//! ```toml
//! display_name = "Billing"
//! version = "1.4.0"
//! load_priority = 10
//! dependencies = ["licensing", { name = "accounts", min_version = "2.0" }]
//!
//! [backend]
//! command = "backend/worker"
//! args = ["--quiet"]
//!
//! [permissions.network]
//! http_requests = true
//!
//! [config]
//! currency = "EUR"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::record::{Dependency, EntryPointSpec, Permissions};

/// Name of the manifest file inside a plugin directory.
pub const MANIFEST_FILE_NAME: &str = "plugin.toml";

/// A dependency written either as a bare name or as a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// `"licensing"`
    Name(String),
    /// `{ name = "licensing", min_version = "1.0" }`
    Full(Dependency),
}

impl From<DependencySpec> for Dependency {
    fn from(spec: DependencySpec) -> Self {
        match spec {
            DependencySpec::Name(name) => Self {
                name,
                min_version: None,
            },
            DependencySpec::Full(dep) => dep,
        }
    }
}

/// The `[backend]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// Worker executable.
    pub command: Option<String>,
    /// Worker arguments.
    pub args: Vec<String>,
    /// Worker environment.
    pub env: BTreeMap<String, String>,
    /// In-process factory name.
    pub builtin: Option<String>,
}

/// Parsed `plugin.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    /// Human-readable name; defaults to the directory name.
    pub display_name: Option<String>,
    /// Version string.
    pub version: Option<String>,
    /// Short description.
    pub description: Option<String>,
    /// Author.
    pub author: Option<String>,
    /// Initial `enabled` value on discovery.
    pub enabled: Option<bool>,
    /// Load priority, lower first.
    pub load_priority: Option<i64>,
    /// Declared dependencies.
    pub dependencies: Vec<DependencySpec>,
    /// How to run the backend.
    pub backend: Option<BackendSection>,
    /// Requested capabilities.
    pub permissions: Permissions,
    /// Free-form configuration handed to the plugin.
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl PluginManifest {
    /// Parse manifest text. `path` is used for error messages only.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParse`] on malformed TOML or a
    /// `[backend]` table that names both a command and a builtin.
    pub fn parse(text: &str, path: &Path) -> PluginResult<Self> {
        let manifest: Self = toml::from_str(text).map_err(|e| PluginError::ManifestParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        manifest.entry_point(path)?;
        Ok(manifest)
    }

    /// Declared dependencies in declaration order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.dependencies.iter().cloned().map(Into::into).collect()
    }

    /// The entry point described by `[backend]`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParse`] if both `command` and `builtin`
    /// are set.
    pub fn entry_point(&self, path: &Path) -> PluginResult<Option<EntryPointSpec>> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        match (&backend.command, &backend.builtin) {
            (Some(_), Some(_)) => Err(PluginError::ManifestParse {
                path: path.to_path_buf(),
                message: "[backend] sets both `command` and `builtin`".into(),
            }),
            (Some(command), None) => Ok(Some(EntryPointSpec::Process {
                command: command.clone(),
                args: backend.args.clone(),
                env: backend.env.clone(),
            })),
            (None, Some(factory)) => Ok(Some(EntryPointSpec::Builtin {
                factory: factory.clone(),
            })),
            (None, None) => Ok(None),
        }
    }
}

/// Path of the manifest inside `plugin_dir`.
#[must_use]
pub fn manifest_path(plugin_dir: &Path) -> PathBuf {
    plugin_dir.join(MANIFEST_FILE_NAME)
}

/// Load `plugin.toml` from a plugin directory.
///
/// Returns `Ok(None)` when the directory has no manifest.
///
/// # Errors
///
/// Returns an error if the manifest exists but cannot be read or parsed.
pub fn load_manifest(plugin_dir: &Path) -> PluginResult<Option<PluginManifest>> {
    let path = manifest_path(plugin_dir);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    PluginManifest::parse(&text, &path).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_full_manifest() {
        let text = r#"
display_name = "Billing"
version = "1.4.0"
enabled = false
load_priority = 10
dependencies = ["licensing", { name = "accounts", min_version = "2.0" }]

[backend]
command = "backend/worker"
args = ["--quiet"]

[permissions.network]
http_requests = true

[config]
currency = "EUR"
"#;
        let manifest = PluginManifest::parse(text, Path::new("plugin.toml")).unwrap();
        assert_eq!(manifest.display_name.as_deref(), Some("Billing"));
        assert_eq!(manifest.enabled, Some(false));
        assert_eq!(manifest.load_priority, Some(10));

        let deps = manifest.dependencies();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].name, "licensing");
        assert_eq!(deps[1].min_version.as_deref(), Some("2.0"));

        assert!(manifest.permissions.network.http_requests);
        // Untouched sections keep their defaults.
        assert!(manifest.permissions.filesystem.read_own);
        assert_eq!(manifest.config["currency"], "EUR");

        let entry = manifest.entry_point(Path::new("plugin.toml")).unwrap();
        assert!(matches!(
            entry,
            Some(EntryPointSpec::Process { ref command, ref args, .. })
                if command == "backend/worker" && args == &["--quiet"]
        ));
    }

    #[test]
    fn rejects_ambiguous_backend() {
        let text = "[backend]\ncommand = \"a\"\nbuiltin = \"b\"\n";
        let err = PluginManifest::parse(text, Path::new("plugin.toml")).unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse { .. }));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = PluginManifest::parse("version = ", Path::new("plugin.toml")).unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse { .. }));
    }

    #[test]
    fn missing_manifest_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_manifest(dir.path()).unwrap().is_none());

        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), "[backend]\nbuiltin = \"echo\"\n")
            .unwrap();
        let manifest = load_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(
            manifest.entry_point(dir.path()).unwrap(),
            Some(EntryPointSpec::Builtin {
                factory: "echo".into()
            })
        );
    }
}
