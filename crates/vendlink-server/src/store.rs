//! Machine record store port.
//!
//! The durable record store is an external collaborator. The registry writes
//! presence through it as a best-effort side effect and the dispatcher reads
//! device addresses from it. [`InMemoryMachineStore`] backs a single-process
//! deployment and the tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use vendlink_core::status::{AuditEvent, PresenceState};

/// Errors raised by a [`MachineStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The seed file could not be read.
    #[error("failed to read machines file: {0}")]
    Io(#[from] std::io::Error),
    /// The seed file is not a JSON array of machine records.
    #[error("failed to parse machines file: {0}")]
    Json(#[from] serde_json::Error),
}

/// A stored machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    /// Machine identifier.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Network address of the controller (`host[:port]` or a full URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Last written presence.
    #[serde(default = "default_status")]
    pub status: PresenceState,
    /// Last written heartbeat time.
    #[serde(default, alias = "lastPingTime")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Whether a push channel was live at the last write.
    #[serde(default)]
    pub ws_connected: bool,
}

fn default_status() -> PresenceState {
    PresenceState::Offline
}

impl MachineRecord {
    /// A record with only an id and an address.
    pub fn new(id: impl Into<String>, address: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: None,
            address: address.map(str::to_string),
            status: PresenceState::Offline,
            last_heartbeat_at: None,
            ws_connected: false,
        }
    }
}

/// Presence fields written on registry transitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// New presence.
    pub status: PresenceState,
    /// Heartbeat time to persist, if known.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Whether a push channel is live.
    pub ws_connected: bool,
}

impl PresenceUpdate {
    /// Device registered or answered a probe at `at`.
    pub fn online(at: DateTime<Utc>) -> Self {
        Self {
            status: PresenceState::Online,
            last_heartbeat_at: Some(at),
            ws_connected: true,
        }
    }

    /// Device channel went away. The last heartbeat is kept as is.
    pub fn offline() -> Self {
        Self {
            status: PresenceState::Offline,
            last_heartbeat_at: None,
            ws_connected: false,
        }
    }
}

/// Record store operations used by the core.
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Look up a machine.
    async fn machine(&self, id: &str) -> Result<Option<MachineRecord>, StoreError>;

    /// Write presence fields. Implementations may skip ids they hold no
    /// record for.
    async fn update_presence(&self, id: &str, update: PresenceUpdate) -> Result<(), StoreError>;

    /// Append an audit record.
    async fn append_event(&self, event: AuditEvent) -> Result<(), StoreError>;
}

/// Audit records kept by an [`InMemoryMachineStore`] unless configured.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Process-local [`MachineStore`].
///
/// Only seeded machines are tracked; presence writes for other ids are
/// dropped. Appended audit records live in a ring of `event_capacity`.
#[derive(Debug)]
pub struct InMemoryMachineStore {
    machines: RwLock<HashMap<String, MachineRecord>>,
    events: Mutex<VecDeque<AuditEvent>>,
    event_capacity: usize,
}

impl Default for InMemoryMachineStore {
    fn default() -> Self {
        Self {
            machines: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl InMemoryMachineStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` appended audit records, dropping the oldest.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Store seeded with `records`.
    pub fn with_machines(records: impl IntoIterator<Item = MachineRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Store seeded from a JSON array of machine records.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        let records: Vec<MachineRecord> = serde_json::from_str(&content)?;
        info!(path = %path.display(), count = records.len(), "loaded machine records");
        Ok(Self::with_machines(records))
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: MachineRecord) {
        let _ = self.machines.write().insert(record.id.clone(), record);
    }

    /// Current copy of a record.
    pub fn get(&self, id: &str) -> Option<MachineRecord> {
        self.machines.read().get(id).cloned()
    }

    /// Retained audit records, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl MachineStore for InMemoryMachineStore {
    async fn machine(&self, id: &str) -> Result<Option<MachineRecord>, StoreError> {
        Ok(self.get(id))
    }

    async fn update_presence(&self, id: &str, update: PresenceUpdate) -> Result<(), StoreError> {
        let mut machines = self.machines.write();
        let Some(record) = machines.get_mut(id) else {
            debug!(machine_id = %id, "presence write for unknown machine dropped");
            return Ok(());
        };
        record.status = update.status;
        record.ws_connected = update.ws_connected;
        if let Some(at) = update.last_heartbeat_at {
            record.last_heartbeat_at = Some(at);
        }
        Ok(())
    }

    async fn append_event(&self, event: AuditEvent) -> Result<(), StoreError> {
        if self.event_capacity == 0 {
            return Ok(());
        }
        let mut events = self.events.lock();
        while events.len() >= self.event_capacity {
            let _ = events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}
