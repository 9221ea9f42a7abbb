//! Device presence and audit value types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence state of a machine.
///
/// `Maintenance` is only ever set by operators through the record store; the
/// live registry reports `Online` or `Offline`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// Connected and answering probes.
    Online,
    /// Not connected.
    Offline,
    /// Taken out of service by an operator.
    Maintenance,
}

impl PresenceState {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time status of one machine as seen by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Machine identifier.
    pub machine_id: String,
    /// Online or offline.
    pub status: PresenceState,
    /// Whether a live channel is registered.
    pub connected: bool,
    /// Most recent liveness signal, `null` when not connected.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl DeviceStatus {
    /// Status of a live entry.
    pub fn online(machine_id: impl Into<String>, last_heartbeat_at: DateTime<Utc>) -> Self {
        Self {
            machine_id: machine_id.into(),
            status: PresenceState::Online,
            connected: true,
            last_heartbeat_at: Some(last_heartbeat_at),
        }
    }

    /// Status of a machine with no live entry.
    pub fn offline(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            status: PresenceState::Offline,
            connected: false,
            last_heartbeat_at: None,
        }
    }
}

/// An online/offline transition, broadcast to observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Machine identifier.
    pub machine_id: String,
    /// New state.
    pub status: PresenceState,
    /// Whether a live channel is registered after the transition.
    pub connected: bool,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    /// Machine came (or stayed) online.
    pub fn online(machine_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            machine_id: machine_id.into(),
            status: PresenceState::Online,
            connected: true,
            timestamp,
        }
    }

    /// Machine went offline.
    pub fn offline(machine_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            machine_id: machine_id.into(),
            status: PresenceState::Offline,
            connected: false,
            timestamp,
        }
    }
}

/// Category of an audit record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Device registered.
    Connect,
    /// Device channel closed or evicted.
    Disconnect,
    /// Sampled probe response.
    Ping,
    /// Dispense command accepted by a transport.
    Dispense,
    /// Dispense command or device failure.
    Error,
    /// Free-form device log line.
    Info,
}

impl AuditKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Ping => "ping",
            Self::Dispense => "dispense",
            Self::Error => "error",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Machine the record is about.
    pub machine_id: String,
    /// Record category.
    pub kind: AuditKind,
    /// Human-readable summary.
    pub message: String,
    /// Structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create a record without structured details.
    pub fn new(
        machine_id: impl Into<String>,
        kind: AuditKind,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            kind,
            message: message.into(),
            data: None,
            timestamp,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
