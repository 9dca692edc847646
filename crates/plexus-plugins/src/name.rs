//! Validated plugin names.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Unique, immutable plugin identity.
///
/// Names are the plugin's directory name and the join key across the
/// registry, the sandbox and the activity log. They contain only lowercase
/// ASCII letters, digits and hyphens, and never start or end with a hyphen.
/// Because underscores are excluded, the per-plugin collection prefix
/// `plugin_<name>_` can never be claimed by two plugins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginName(String);

/// Deserialize with validation so a tampered registry row cannot smuggle in
/// a path-traversal name.
impl<'de> Deserialize<'de> for PluginName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginName {
    /// Create a new `PluginName`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidName`] if the name is empty or contains
    /// characters outside `[a-z0-9-]`.
    pub fn new(name: impl Into<String>) -> PluginResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a string is a valid plugin name.
    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        Self::validate(name).is_ok()
    }

    /// Prefix of every data-store collection this plugin owns.
    #[must_use]
    pub fn collection_prefix(&self) -> String {
        format!("plugin_{}_", self.0)
    }

    fn validate(name: &str) -> PluginResult<()> {
        if name.is_empty() {
            return Err(PluginError::InvalidName(
                "plugin name must not be empty".into(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(PluginError::InvalidName(format!(
                "plugin name must contain only lowercase alphanumeric characters and hyphens, got: {name}"
            )));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(PluginError::InvalidName(format!(
                "plugin name must not start or end with a hyphen, got: {name}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PluginName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(PluginName::new("billing").is_ok());
        assert!(PluginName::new("seo-tools").is_ok());
        assert!(PluginName::new("v2").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(PluginName::new("").is_err());
        assert!(PluginName::new("Billing").is_err());
        assert!(PluginName::new("my_plugin").is_err());
        assert!(PluginName::new("../etc").is_err());
        assert!(PluginName::new("-billing").is_err());
        assert!(PluginName::new("billing-").is_err());
        assert!(PluginName::new(".git").is_err());
    }

    #[test]
    fn deserialize_rejects_bad_names() {
        let ok: PluginName = serde_json::from_str("\"billing\"").unwrap();
        assert_eq!(ok.as_str(), "billing");
        assert!(serde_json::from_str::<PluginName>("\"../../x\"").is_err());
    }

    #[test]
    fn collection_prefix_uses_underscore_separator() {
        let name = PluginName::new("seo-tools").unwrap();
        assert_eq!(name.collection_prefix(), "plugin_seo-tools_");
    }
}
