//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConsistencySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `CONSISTENCY_*` environment variable overrides
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ConsistencySettings, LogFormat, LogLevel};

/// Resolve the default settings file path (`~/.consistency/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".consistency").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ConsistencySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConsistencySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the settings file at `path`, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<ConsistencySettings> {
    let defaults = serde_json::to_value(ConsistencySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut ConsistencySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`, which maps a variable name to its
/// value.
pub fn apply_overrides(settings: &mut ConsistencySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Client channel ──────────────────────────────────────────────
    if let Some(v) = env.string("CONSISTENCY_PUBLIC_HOST") {
        settings.client.host = v;
    }
    if let Some(v) = env.u16("CONSISTENCY_PUBLIC_PORT", 0, 65535) {
        settings.client.port = v;
    }
    if let Some(v) = env.usize("CONSISTENCY_MAX_SEND_QUEUE", 1, 1_000_000) {
        settings.client.max_send_queue = v;
    }
    if let Some(v) = env.u64("CONSISTENCY_HEARTBEAT_INTERVAL", 1, 3600) {
        settings.client.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.bool("CONSISTENCY_CLOSE_ON_PROTOCOL_ERROR") {
        settings.client.close_on_protocol_error = v;
    }

    // ── Backend channel ─────────────────────────────────────────────
    if let Some(v) = env.string("CONSISTENCY_BACKEND_HOST") {
        settings.backend.host = v;
    }
    if let Some(v) = env.u16("CONSISTENCY_BACKEND_PORT", 0, 65535) {
        settings.backend.port = v;
    }
    if let Some(v) = env.usize("CONSISTENCY_MAX_FRAME_BYTES", 16, 16 * 1024 * 1024) {
        settings.backend.max_frame_bytes = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CONSISTENCY_LOG_LEVEL") {
        match parse_log_level(&v) {
            Some(level) => settings.logging.level = level,
            None => tracing::warn!(key = "CONSISTENCY_LOG_LEVEL", value = %v, "invalid log level, ignoring"),
        }
    }
    if let Some(v) = env.string("CONSISTENCY_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "CONSISTENCY_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a log level name (`trace` through `error`, case-insensitive).
pub fn parse_log_level(val: &str) -> Option<LogLevel> {
    match val.trim().to_lowercase().as_str() {
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "error" => Some(LogLevel::Error),
        _ => None,
    }
}

/// Parse a log format name (`json` or `pretty`, case-insensitive).
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> ConsistencySettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = ConsistencySettings::default();
        apply_overrides(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"client": {"port": 4691, "host": "localhost"}});
        let source = serde_json::json!({"client": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["client"]["port"], 9090);
        assert_eq!(merged["client"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/consistency/settings.json");
        let settings = read_settings_file(path).unwrap();
        assert_eq!(settings, ConsistencySettings::default());
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"client": {"port": 9000, "maxSendQueue": 8}, "backend": {"host": "0.0.0.0"}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.client.port, 9000);
        assert_eq!(settings.client.max_send_queue, 8);
        assert_eq!(settings.client.host, "localhost");
        assert_eq!(settings.backend.host, "0.0.0.0");
        assert_eq!(settings.backend.port, 1991);
    }

    #[test]
    fn invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = read_settings_file(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn wrong_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"client": {"port": "high"}}"#).unwrap();
        assert!(read_settings_file(&path).is_err());
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_ports_and_hosts() {
        let settings = overrides(&[
            ("CONSISTENCY_PUBLIC_HOST", "0.0.0.0"),
            ("CONSISTENCY_PUBLIC_PORT", "8000"),
            ("CONSISTENCY_BACKEND_HOST", "10.0.0.2"),
            ("CONSISTENCY_BACKEND_PORT", "4321"),
        ]);
        assert_eq!(settings.client.host, "0.0.0.0");
        assert_eq!(settings.client.port, 8000);
        assert_eq!(settings.backend.host, "10.0.0.2");
        assert_eq!(settings.backend.port, 4321);
    }

    #[test]
    fn env_invalid_values_are_ignored() {
        let settings = overrides(&[
            ("CONSISTENCY_PUBLIC_PORT", "99999"),
            ("CONSISTENCY_MAX_SEND_QUEUE", "0"),
            ("CONSISTENCY_LOG_FORMAT", "xml"),
            ("CONSISTENCY_CLOSE_ON_PROTOCOL_ERROR", "maybe"),
        ]);
        let defaults = ConsistencySettings::default();
        assert_eq!(settings, defaults);
    }

    #[test]
    fn env_invalid_log_level_keeps_default() {
        let settings = overrides(&[("CONSISTENCY_LOG_LEVEL", "loud")]);
        assert_eq!(settings.logging.level, LogLevel::Info);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn env_empty_string_is_ignored() {
        let settings = overrides(&[("CONSISTENCY_PUBLIC_HOST", "")]);
        assert_eq!(settings.client.host, "localhost");
    }

    #[test]
    fn env_logging_overrides() {
        let settings = overrides(&[
            ("CONSISTENCY_LOG_LEVEL", "debug"),
            ("CONSISTENCY_LOG_FORMAT", "PRETTY"),
        ]);
        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn env_queue_and_frame_limits() {
        let settings = overrides(&[
            ("CONSISTENCY_MAX_SEND_QUEUE", "16"),
            ("CONSISTENCY_MAX_FRAME_BYTES", "1024"),
            ("CONSISTENCY_HEARTBEAT_INTERVAL", "5"),
            ("CONSISTENCY_CLOSE_ON_PROTOCOL_ERROR", "off"),
        ]);
        assert_eq!(settings.client.max_send_queue, 16);
        assert_eq!(settings.backend.max_frame_bytes, 1024);
        assert_eq!(settings.client.heartbeat_interval_secs, 5);
        assert!(!settings.client.close_on_protocol_error);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nope"), None);
    }

    #[test]
    fn parse_log_level_names() {
        assert_eq!(parse_log_level("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(parse_log_level("warning"), Some(LogLevel::Warn));
        assert_eq!(parse_log_level("loud"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("4691", 1, 65535), Some(4691));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
        assert_eq!(parse_usize_range("10", 1, 10), Some(10));
        assert_eq!(parse_usize_range("11", 1, 10), None);
    }
}
