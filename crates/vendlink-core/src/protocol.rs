//! JSON frames exchanged over the device/observer WebSocket.
//!
//! Every frame is a single JSON object tagged by its `type` field. Inbound
//! frames come from devices or observers; outbound frames are produced by
//! the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, VendError};
use crate::status::{DeviceStatus, StatusEvent};

/// Frame sent by a participant to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Claim a machine id and become a device channel.
    Register {
        /// Claimed machine id.
        #[serde(rename = "machineId")]
        machine_id: String,
    },
    /// Become an observer channel.
    Subscribe,
    /// Answer to a liveness probe.
    Pong {
        /// Responding machine id.
        #[serde(rename = "machineId")]
        machine_id: String,
    },
    /// Free-form device log line.
    Log {
        /// Reporting machine id.
        #[serde(rename = "machineId")]
        machine_id: String,
        /// Log text.
        #[serde(default)]
        message: String,
    },
}

impl InboundFrame {
    /// Decode a text frame.
    ///
    /// Frames naming an empty machine id are rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let frame: Self = serde_json::from_str(text)?;
        match &frame {
            Self::Register { machine_id } | Self::Pong { machine_id } | Self::Log { machine_id, .. }
                if machine_id.trim().is_empty() =>
            {
                Err(VendError::EmptyMachineId)
            }
            _ => Ok(frame),
        }
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Subscribe => "subscribe",
            Self::Pong { .. } => "pong",
            Self::Log { .. } => "log",
        }
    }
}

/// Body of a `machine_update` frame: either a full snapshot or one change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MachineUpdate {
    /// Every live entry at the moment an observer subscribed.
    Snapshot {
        /// Live entries.
        machines: Vec<DeviceStatus>,
    },
    /// One online/offline transition.
    Change(StatusEvent),
}

/// Frame sent by the server to a participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Registration accepted.
    Registered {
        /// Registered machine id.
        #[serde(rename = "machineId")]
        machine_id: String,
    },
    /// Subscription accepted.
    Subscribed {
        /// Acknowledgment text.
        message: String,
    },
    /// Liveness probe.
    Ping {
        /// Probe send time, milliseconds since the Unix epoch.
        timestamp: i64,
    },
    /// Status snapshot or change.
    MachineUpdate(MachineUpdate),
    /// Push-channel dispense command.
    Dispense {
        /// Actuator pin.
        slot: u32,
        /// Units to release.
        quantity: u32,
        /// Command issue time, milliseconds since the Unix epoch.
        timestamp: i64,
    },
}

impl OutboundFrame {
    /// Probe frame stamped with `at`.
    pub fn ping(at: DateTime<Utc>) -> Self {
        Self::Ping {
            timestamp: at.timestamp_millis(),
        }
    }

    /// Dispense frame stamped with `at`.
    pub fn dispense(pin: u32, quantity: u32, at: DateTime<Utc>) -> Self {
        Self::Dispense {
            slot: pin,
            quantity,
            timestamp: at.timestamp_millis(),
        }
    }

    /// Serialize to the text sent on the wire.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
