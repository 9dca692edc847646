//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge the user config (`<config_dir>/plexus/config.toml`)
//! 3. Merge the explicit `--config` file, or `{workspace}/plexus.toml`
//! 4. Apply `PLEXUS_*` env var fallbacks for fields no file set
//! 5. Deserialize merged tree → `Config`
//! 6. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Name of the workspace-level config file.
pub const WORKSPACE_CONFIG_FILE: &str = "plexus.toml";

/// Which layer last set a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLayer {
    /// Embedded `defaults.toml`.
    Defaults,
    /// The per-user config file.
    User,
    /// The explicit or workspace config file.
    Workspace,
    /// A `PLEXUS_*` environment variable.
    Env(String),
}

/// Field path (e.g. `"health.interval_secs"`) → layer that set it.
pub type FieldSources = HashMap<String, ConfigLayer>;

/// A validated config plus where each value came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final configuration.
    pub config: Config,
    /// Source layer of every leaf field.
    pub field_sources: FieldSources,
    /// Files that contributed, in merge order.
    pub loaded_files: Vec<String>,
}

/// Inputs to [`load`]. Every field is optional so tests can pin them.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file; must exist when given.
    pub config_file: Option<PathBuf>,
    /// Directory searched for `plexus.toml` when no explicit file is given.
    pub workspace_root: Option<PathBuf>,
    /// Overrides the per-user config directory.
    pub user_config_dir: Option<PathBuf>,
    /// Overrides the process environment.
    pub env: Option<HashMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Environment fallbacks
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum EnvKind {
    Str,
    Int,
    Bool,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: EnvKind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "PLEXUS_PLUGINS_DIR",
        field_path: "plugins.dir",
        kind: EnvKind::Str,
    },
    EnvMapping {
        var_name: "PLEXUS_SHARED_DIR",
        field_path: "plugins.shared_dir",
        kind: EnvKind::Str,
    },
    EnvMapping {
        var_name: "PLEXUS_STORAGE_BACKEND",
        field_path: "storage.backend",
        kind: EnvKind::Str,
    },
    EnvMapping {
        var_name: "PLEXUS_STORAGE_PATH",
        field_path: "storage.path",
        kind: EnvKind::Str,
    },
    EnvMapping {
        var_name: "PLEXUS_HEALTH_INTERVAL_SECS",
        field_path: "health.interval_secs",
        kind: EnvKind::Int,
    },
    EnvMapping {
        var_name: "PLEXUS_WATCH",
        field_path: "watcher.enabled",
        kind: EnvKind::Bool,
    },
    EnvMapping {
        var_name: "PLEXUS_LOG_LEVEL",
        field_path: "logging.level",
        kind: EnvKind::Str,
    },
    EnvMapping {
        var_name: "PLEXUS_LOG_FORMAT",
        field_path: "logging.format",
        kind: EnvKind::Str,
    },
];

fn env_value(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let err = |message: &str| ConfigError::EnvError {
        var_name: mapping.var_name.to_owned(),
        message: message.to_owned(),
    };
    match mapping.kind {
        EnvKind::Str => Ok(toml::Value::String(raw.to_owned())),
        EnvKind::Int => raw
            .trim()
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|_| err("expected an integer")),
        EnvKind::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Ok(toml::Value::Boolean(false)),
            _ => Err(err("expected a boolean")),
        },
    }
}

/// Apply env fallbacks to fields that are still at their default.
///
/// Returns how many variables were applied.
fn apply_env_fallbacks(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env: &HashMap<String, String>,
) -> ConfigResult<usize> {
    let mut applied = 0usize;
    for mapping in ENV_MAPPINGS {
        let Some(raw) = env.get(mapping.var_name) else {
            continue;
        };
        let set_by_file = sources
            .get(mapping.field_path)
            .is_some_and(|layer| *layer != ConfigLayer::Defaults);
        if set_by_file {
            debug!(var = mapping.var_name, "config file already sets field, ignoring env var");
            continue;
        }
        let value = env_value(mapping, raw)?;
        set_path(merged, mapping.field_path, value);
        sources.insert(
            mapping.field_path.to_owned(),
            ConfigLayer::Env(mapping.var_name.to_owned()),
        );
        applied = applied.saturating_add(1);
    }
    Ok(applied)
}

fn set_path(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let toml::Value::Table(table) = current else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Deep-merge `overlay` into `base`, recording which layer set each leaf.
///
/// Tables merge per key; scalars and arrays from the overlay replace.
fn deep_merge_tracking(
    base: &mut toml::Value,
    overlay: &toml::Value,
    prefix: &str,
    layer: &ConfigLayer,
    sources: &mut FieldSources,
) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge_tracking(base_val, overlay_val, &path, layer, sources);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                    record_leaves(overlay_val, &path, layer, sources);
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
            sources.insert(prefix.to_owned(), layer.clone());
        },
    }
}

fn record_leaves(val: &toml::Value, prefix: &str, layer: &ConfigLayer, sources: &mut FieldSources) {
    if let toml::Value::Table(table) = val {
        for (key, child) in table {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            record_leaves(child, &path, layer, sources);
        }
    } else {
        sources.insert(prefix.to_owned(), layer.clone());
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load the configuration with layered file precedence.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, an explicit
/// config file is missing, an env var cannot be parsed, or the merged
/// configuration fails validation.
pub fn load(options: &LoadOptions) -> ConfigResult<ResolvedConfig> {
    let env = options
        .env
        .clone()
        .unwrap_or_else(|| std::env::vars().collect());

    // 1. Embedded defaults.
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", &ConfigLayer::Defaults, &mut field_sources);

    // 2. User config.
    let user_dir = options.user_config_dir.clone().or_else(user_config_dir);
    if let Some(dir) = user_dir {
        let path = dir.join("config.toml");
        if let Some(overlay) = try_load_file(&path)? {
            deep_merge_tracking(&mut merged, &overlay, "", &ConfigLayer::User, &mut field_sources);
            loaded_files.push(path.display().to_string());
            info!(path = %path.display(), "loaded user config");
        }
    } else {
        debug!("no user config directory available, skipping user layer");
    }

    // 3. Explicit file (required) or workspace file (optional).
    let workspace_file = match (&options.config_file, &options.workspace_root) {
        (Some(path), _) => Some((read_required(path)?, path.clone())),
        (None, Some(root)) => {
            let path = root.join(WORKSPACE_CONFIG_FILE);
            try_load_file(&path)?.map(|overlay| (overlay, path))
        },
        (None, None) => None,
    };
    if let Some((overlay, path)) = workspace_file {
        deep_merge_tracking(
            &mut merged,
            &overlay,
            "",
            &ConfigLayer::Workspace,
            &mut field_sources,
        );
        loaded_files.push(path.display().to_string());
        info!(path = %path.display(), "loaded workspace config");
    }

    // 4. Env fallbacks.
    let env_count = apply_env_fallbacks(&mut merged, &mut field_sources, &env)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    // 5. Deserialize.
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    // 6. Validate.
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Load a config from a specific file path (no layering besides defaults).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or
/// validated.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let content = read_bounded(path)?;
    let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;
    validate::validate(&config)?;
    Ok(config)
}

fn user_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "plexus", "plexus").map(|d| d.config_dir().to_path_buf())
}

fn read_bounded(path: &Path) -> ConfigResult<String> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }
    Ok(content)
}

fn parse_overlay(path: &Path, content: &str) -> ConfigResult<toml::Value> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })
}

fn read_required(path: &Path) -> ConfigResult<toml::Value> {
    let content = read_bounded(path)?;
    parse_overlay(path, &content)
}

/// Try to load a file, returning `None` if the file doesn't exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    match read_bounded(path) {
        Ok(content) => parse_overlay(path, &content).map(Some),
        Err(ConfigError::ReadError { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            debug!(path = %path.display(), "config file not found, skipping");
            Ok(None)
        },
        Err(e) => Err(e),
    }
}
