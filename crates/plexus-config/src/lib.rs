#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Layered configuration for the Plexus plugin runtime.
//!
//! # Usage
//!
//! ```rust,no_run
//! use plexus_config::Config;
//!
//! // defaults → user → ./plexus.toml → PLEXUS_* env fallbacks
//! let resolved = Config::load(None).unwrap();
//! println!("Plugins live in {}", resolved.config.plugins.dir.display());
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Explicit file** (`--config`) or **workspace** (`./plexus.toml`)
//! 2. **User** (`<config_dir>/plexus/config.toml`)
//! 3. **Environment variables** (`PLEXUS_*`), fallback only
//! 4. **Embedded defaults** (`defaults.toml` compiled into binary)
//!
//! This crate has no dependencies on other plexus crates. Conversion into
//! runtime settings happens in the daemon.

/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLayer, FieldSources, LoadOptions, ResolvedConfig};
pub use types::*;

impl Config {
    /// Load configuration with the full precedence chain.
    ///
    /// When `config_file` is given it replaces the `./plexus.toml` lookup
    /// and must exist.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(config_file: Option<&std::path::Path>) -> ConfigResult<ResolvedConfig> {
        loader::load(&LoadOptions {
            config_file: config_file.map(std::path::Path::to_path_buf),
            workspace_root: std::env::current_dir().ok(),
            ..LoadOptions::default()
        })
    }
}
