//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use relay_core::{RelayError, SandboxMode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::RelaySettings;

pub(crate) fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Relay state directory: `$RELAY_HOME`, else `~/.relay`.
pub fn relay_home() -> PathBuf {
    read_env_string("RELAY_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".relay"))
}

/// Resolve the path to the settings file (`<relay home>/settings.json`).
pub fn settings_path() -> PathBuf {
    relay_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Like [`load_settings_from_path`], but a malformed file degrades to
/// defaults (still with env overrides) instead of failing startup. The
/// error comes back alongside so the caller can report it once logging is
/// up.
pub fn load_settings_or_default(path: &Path) -> (RelaySettings, Option<RelayError>) {
    match load_settings_from_path(path) {
        Ok(settings) => (settings, None),
        Err(e) => {
            let mut settings = RelaySettings::default();
            apply_env_overrides(&mut settings);
            (settings, Some(RelayError::from(e)))
        }
    }
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored (fall back to file/default) with a warning.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    if let Some(v) = read_env_string("RELAY_CODEX_BIN") {
        settings.codex.binary = v;
    }
    if let Some(v) = read_env_string("RELAY_DEFAULT_MODEL") {
        settings.codex.default_model = Some(v);
    }
    if let Some(v) = read_env_string("RELAY_SANDBOX") {
        match v.parse::<SandboxMode>() {
            Ok(mode) => settings.codex.sandbox = mode,
            Err(e) => warn!(key = "RELAY_SANDBOX", value = %v, error = %e, "ignoring env var"),
        }
    }
    if let Some(v) = read_env_u64("RELAY_TIMEOUT_SECS", 1, 86_400) {
        settings.codex.timeout_secs = v;
    }
    if let Some(v) = read_env_u16("RELAY_HUB_PORT", 1, 65535) {
        settings.hub.port = v;
    }
    if let Some(v) = read_env_string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("RELAY_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"hub": {"port": 7337, "enabled": true}});
        let source = serde_json::json!({"hub": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["hub"]["port"], 9090);
        assert_eq!(merged["hub"]["enabled"], true);
    }

    #[test]
    fn merge_skips_nulls() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null, "b": 2});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_replaces_arrays() {
        let target = serde_json::json!({"list": [1, 2, 3]});
        let source = serde_json::json!({"list": [9]});
        assert_eq!(deep_merge(target, source)["list"], serde_json::json!([9]));
    }

    #[test]
    fn parse_bool_values() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u64_range("30", 1, 86_400), Some(30));
        assert_eq!(parse_u64_range("abc", 1, 86_400), None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.codex.binary, RelaySettings::default().codex.binary);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"codex": {"defaultModel": "gpt-5-codex", "timeoutSecs": 42}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.codex.default_model.as_deref(), Some("gpt-5-codex"));
        assert_eq!(settings.codex.timeout_secs, 42);
        assert_eq!(settings.hub.forward_queue_cap, 2000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }

    #[test]
    fn malformed_file_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"hub": {"port": "not a number"}}"#).unwrap();
        let (settings, error) = load_settings_or_default(&path);
        assert_eq!(settings.hub.forward_queue_cap, 2000);
        assert!(settings.hub.enabled);
        assert!(matches!(error, Some(RelayError::ConfigurationInvalid(_))));
    }
}
