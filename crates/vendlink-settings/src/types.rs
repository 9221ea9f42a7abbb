//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may name only the fields it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the vendlink server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VendlinkSettings {
    /// Listener and per-connection limits.
    pub server: ServerSettings,
    /// Probe cadence and eviction budget.
    pub heartbeat: HeartbeatSettings,
    /// Direct command transport.
    pub dispatch: DispatchSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Machine record store.
    pub store: StoreSettings,
    /// In-memory audit log.
    pub events: EventSettings,
}

impl VendlinkSettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.intervalMs must be greater than 0".into(),
            ));
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeat.timeoutMs ({}) must exceed heartbeat.intervalMs ({})",
                self.heartbeat.timeout_ms, self.heartbeat.interval_ms
            )));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be greater than 0".into(),
            ));
        }
        if self.dispatch.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "dispatch.requestTimeoutMs must be greater than 0".into(),
            ));
        }
        if !self.dispatch.command_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "dispatch.commandPath must start with '/': {}",
                self.dispatch.command_path
            )));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// Outbound frames buffered per channel before sends start failing.
    pub send_queue_capacity: usize,
    /// Largest accepted inbound WebSocket message, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
        }
    }
}

/// Heartbeat settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Time between probe sweeps.
    pub interval_ms: u64,
    /// Silence after which a device is evicted.
    pub timeout_ms: u64,
    /// Every Nth probe response is written to the audit log.
    pub ping_log_sample_every: u64,
}

impl HeartbeatSettings {
    /// Sweep interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Eviction budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 30_000,
            ping_log_sample_every: 10,
        }
    }
}

/// Direct command transport settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Bounded wait for the device's HTTP endpoint.
    pub request_timeout_ms: u64,
    /// Path appended to the device address.
    pub command_path: String,
    /// Scheme used when the stored address has none.
    pub default_scheme: String,
}

impl DispatchSettings {
    /// Request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            command_path: "/dispense".to_string(),
            default_scheme: "http".to_string(),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name, case-insensitively.
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_ascii_lowercase().as_str() {
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Machine record store settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// JSON array of machine records loaded at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machines_file: Option<PathBuf>,
}

/// Audit log settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSettings {
    /// Records kept in memory for `/api/events`.
    pub capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
