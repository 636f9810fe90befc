//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;
use vigil_core::flags::parse_switch;

use crate::errors::{Result, SettingsError};
use crate::types::AgentSettings;

/// Resolve the path to the settings file (`~/.vigil/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".vigil").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<AgentSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<AgentSettings> {
    let defaults = serde_json::to_value(AgentSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: AgentSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `VIGIL_*` environment overrides. Invalid values are ignored.
pub fn apply_env_overrides(settings: &mut AgentSettings) {
    if let Some(v) = read_env_string("VIGIL_APP_NAME") {
        settings.app_name = v;
    }
    if let Some(v) = read_env_bool("VIGIL_ENABLED") {
        settings.enabled = v;
    }
    if let Some(v) = read_env_string("VIGIL_NAMESPACE") {
        settings.namespace = v;
    }
    if let Some(v) = read_env_usize("VIGIL_MAX_ERRORS", 1, 10_000) {
        settings.max_errors_per_transaction = v;
    }
    if let Some(v) = read_env_usize("VIGIL_MAX_FINISHED", 1, 1_000_000) {
        settings.max_finished_transactions = v;
    }
    if let Some(v) = read_env_string("VIGIL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_string("VIGIL_LOG_FILE") {
        settings.logging.file = Some(PathBuf::from(v));
    }
}

fn validate(settings: &AgentSettings) -> Result<()> {
    if settings.namespace.trim().is_empty() {
        return Err(SettingsError::InvalidValue(
            "namespace must not be empty".to_string(),
        ));
    }
    if settings.max_errors_per_transaction == 0 {
        return Err(SettingsError::InvalidValue(
            "maxErrorsPerTransaction must be at least 1".to_string(),
        ));
    }
    if settings.max_finished_transactions == 0 {
        return Err(SettingsError::InvalidValue(
            "maxFinishedTransactions must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_switch(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
