//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Smallest accepted health sweep interval.
const MIN_HEALTH_INTERVAL_SECS: u64 = 5;

/// Largest accepted timeout for any plugin-supplied call.
const MAX_TIMEOUT_SECS: u64 = 3600;

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_plugins(config)?;
    validate_loader(config)?;
    validate_health(config)?;
    validate_watcher(config)?;
    validate_activity(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    let p = &config.plugins;
    if p.dir.as_os_str().is_empty() {
        return Err(invalid("plugins.dir", "plugin directory must not be empty"));
    }
    if p.shared_dir.as_os_str().is_empty() {
        return Err(invalid("plugins.shared_dir", "shared directory must not be empty"));
    }
    for name in &p.core_collections {
        if name.is_empty() {
            return Err(invalid(
                "plugins.core_collections",
                "collection names must not be empty",
            ));
        }
        // Collections under `plugin_` belong to individual plugins.
        if name.starts_with("plugin_") {
            return Err(invalid(
                "plugins.core_collections",
                format!("'{name}' is inside the per-plugin namespace"),
            ));
        }
    }
    Ok(())
}

fn check_timeout(field: &str, secs: u64) -> ConfigResult<()> {
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        return Err(invalid(
            field,
            format!("must be between 1 and {MAX_TIMEOUT_SECS} seconds, got {secs}"),
        ));
    }
    Ok(())
}

fn validate_loader(config: &Config) -> ConfigResult<()> {
    check_timeout("loader.entry_timeout_secs", config.loader.entry_timeout_secs)?;
    check_timeout("loader.cleanup_timeout_secs", config.loader.cleanup_timeout_secs)
}

fn validate_health(config: &Config) -> ConfigResult<()> {
    let h = &config.health;

    if h.interval_secs < MIN_HEALTH_INTERVAL_SECS {
        return Err(invalid(
            "health.interval_secs",
            format!("must be at least {MIN_HEALTH_INTERVAL_SECS} seconds"),
        ));
    }
    check_timeout("health.check_timeout_secs", h.check_timeout_secs)?;
    if h.check_timeout_secs >= h.interval_secs {
        return Err(invalid(
            "health.check_timeout_secs",
            "must be shorter than health.interval_secs",
        ));
    }

    let thresholds = [
        ("health.warning_memory_mb", h.warning_memory_mb),
        ("health.critical_memory_mb", h.critical_memory_mb),
        ("health.reload_memory_mb", h.reload_memory_mb),
        ("health.warning_cpu_percent", h.warning_cpu_percent),
        ("health.critical_cpu_percent", h.critical_cpu_percent),
    ];
    for (field, value) in thresholds {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(field, "must be a finite positive number"));
        }
    }

    if h.warning_memory_mb > h.critical_memory_mb {
        return Err(invalid(
            "health.warning_memory_mb",
            "must not exceed health.critical_memory_mb",
        ));
    }
    if h.critical_memory_mb > h.reload_memory_mb {
        return Err(invalid(
            "health.critical_memory_mb",
            "must not exceed health.reload_memory_mb",
        ));
    }
    if h.warning_cpu_percent > h.critical_cpu_percent {
        return Err(invalid(
            "health.warning_cpu_percent",
            "must not exceed health.critical_cpu_percent",
        ));
    }
    Ok(())
}

fn validate_watcher(config: &Config) -> ConfigResult<()> {
    if config.watcher.debounce_ms > 60_000 {
        return Err(invalid("watcher.debounce_ms", "must be at most 60000"));
    }
    Ok(())
}

fn validate_activity(config: &Config) -> ConfigResult<()> {
    if config.activity.retention_days == 0 {
        return Err(invalid("activity.retention_days", "must be at least 1"));
    }
    if config.activity.prune_interval_secs == 0 {
        return Err(invalid("activity.prune_interval_secs", "must be at least 1"));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !matches!(
        l.level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid(
            "logging.level",
            format!(
                "unknown level '{}'; expected trace, debug, info, warn or error",
                l.level
            ),
        ));
    }
    if !matches!(
        l.format.to_ascii_lowercase().as_str(),
        "pretty" | "compact" | "json" | "full"
    ) {
        return Err(invalid(
            "logging.format",
            format!(
                "unknown format '{}'; expected pretty, compact, json or full",
                l.format
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn rejects_short_health_interval() {
        let mut config = Config::default();
        config.health.interval_secs = 1;
        assert_eq!(field_of(validate(&config).unwrap_err()), "health.interval_secs");
    }

    #[test]
    fn rejects_check_timeout_longer_than_interval() {
        let mut config = Config::default();
        config.health.check_timeout_secs = 60;
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "health.check_timeout_secs"
        );
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.health.critical_memory_mb = 2000.0;
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "health.critical_memory_mb"
        );

        let mut config = Config::default();
        config.health.warning_cpu_percent = f64::NAN;
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "health.warning_cpu_percent"
        );
    }

    #[test]
    fn rejects_core_collection_in_plugin_namespace() {
        let mut config = Config::default();
        config.plugins.core_collections.push("plugin_billing_invoices".into());
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "plugins.core_collections"
        );
    }

    #[test]
    fn rejects_zero_timeouts_and_unknown_logging() {
        let mut config = Config::default();
        config.loader.entry_timeout_secs = 0;
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "loader.entry_timeout_secs"
        );

        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert_eq!(field_of(validate(&config).unwrap_err()), "logging.format");
    }
}
