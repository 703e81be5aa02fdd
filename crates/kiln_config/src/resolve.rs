//! Toggle resolution: layering environment overrides on top of `kiln.toml`.

use crate::error::ConfigError;
use crate::types::CacheConfig;
use kiln_common::FloatPrecision;

/// Bypass cache loading unconditionally (fresh artifacts are still written).
pub const ENV_FORCE_RECOMPILE: &str = "KILN_FORCE_RECOMPILE";
/// Disable both cache loading and cache writing.
pub const ENV_NO_CACHE: &str = "KILN_NO_CACHE";
/// Only accept cached artifacts compiled for this float precision.
pub const ENV_FP_PRECISION: &str = "KILN_FP_PRECISION";

/// The effective cache toggles for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheToggles {
    /// Whether the cache is consulted and written at all.
    pub enabled: bool,
    /// Whether cache loading is skipped.
    pub force_recompile: bool,
    /// Precision a cached artifact must have been compiled for, if any.
    pub float_precision: Option<FloatPrecision>,
}

/// Resolves toggles from the configuration and an environment lookup.
///
/// An environment variable that is set overrides the configured value; an
/// unset variable leaves it alone. The lookup is a parameter so tests do not
/// have to mutate the process environment.
pub fn resolve_toggles<F>(config: &CacheConfig, lookup: F) -> Result<CacheToggles, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut toggles = CacheToggles {
        enabled: config.enabled,
        force_recompile: config.force_recompile,
        float_precision: config.float_precision,
    };

    if let Some(value) = lookup(ENV_NO_CACHE) {
        toggles.enabled = !parse_flag(ENV_NO_CACHE, &value)?;
    }
    if let Some(value) = lookup(ENV_FORCE_RECOMPILE) {
        toggles.force_recompile = parse_flag(ENV_FORCE_RECOMPILE, &value)?;
    }
    if let Some(value) = lookup(ENV_FP_PRECISION) {
        if value.trim().is_empty() {
            toggles.float_precision = None;
        } else {
            let precision = value.parse().map_err(|_| ConfigError::InvalidToggle {
                name: ENV_FP_PRECISION.to_string(),
                value: value.clone(),
            })?;
            toggles.float_precision = Some(precision);
        }
    }

    Ok(toggles)
}

/// Resolves toggles against the real process environment.
pub fn resolve_toggles_from_env(config: &CacheConfig) -> Result<CacheToggles, ConfigError> {
    resolve_toggles(config, |name| std::env::var(name).ok())
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidToggle {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
