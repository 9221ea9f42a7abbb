//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`VendlinkSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `VENDLINK_*` environment overrides
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{LogFormat, VendlinkSettings};

/// Resolve the default settings file (`~/.vendlink/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".vendlink").join("settings.json")
}

/// Load settings.
///
/// With `explicit = Some(path)` the file must exist. Without it the default
/// path is tried and silently skipped when absent.
pub fn load_settings(explicit: Option<&Path>) -> Result<VendlinkSettings> {
    match explicit {
        Some(path) if !path.exists() => Err(SettingsError::NotFound(path.to_path_buf())),
        Some(path) => load_settings_from_path(path),
        None => load_settings_from_path(&settings_path()),
    }
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<VendlinkSettings> {
    let mut settings = read_layered(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_layered(path: &Path) -> Result<VendlinkSettings> {
    let defaults = serde_json::to_value(VendlinkSettings::default())?;

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

/// Apply `VENDLINK_*` environment overrides.
///
/// Values that fail to parse or fall out of range are ignored with a warning.
pub fn apply_env_overrides(settings: &mut VendlinkSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_overrides<F>(settings: &mut VendlinkSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.read_string("VENDLINK_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.read_u16("VENDLINK_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.read_u64("VENDLINK_HEARTBEAT_INTERVAL_MS", 100, 3_600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = env.read_u64("VENDLINK_HEARTBEAT_TIMEOUT_MS", 100, 86_400_000) {
        settings.heartbeat.timeout_ms = v;
    }
    if let Some(v) = env.read_u64("VENDLINK_DISPATCH_TIMEOUT_MS", 100, 600_000) {
        settings.dispatch.request_timeout_ms = v;
    }
    if let Some(v) = env.read_string("VENDLINK_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = env.read_string("VENDLINK_LOG_FORMAT") {
        match LogFormat::parse(&raw) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "VENDLINK_LOG_FORMAT", value = %raw, "invalid log format env var, ignoring"),
        }
    }
    if let Some(v) = env.read_string("VENDLINK_MACHINES_FILE") {
        settings.store.machines_file = Some(PathBuf::from(v));
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn read_string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn read_u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.read_string(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn read_u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.read_string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
