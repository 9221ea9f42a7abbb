//! Audit event sink.
//!
//! Every connect, disconnect, sampled ping, dispense outcome and device log
//! line passes through an [`EventSink`]. The production sink, [`EventLog`],
//! mirrors each record to `tracing`, keeps a bounded in-memory tail for
//! `/api/events`, and forwards to the record store when one is attached.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vendlink_core::status::{AuditEvent, AuditKind};

use crate::store::MachineStore;

/// Append-only consumer of audit records.
pub trait EventSink: Send + Sync {
    /// Record one event. Must not block.
    fn record(&self, event: AuditEvent);
}

/// Bounded audit tail with optional durable forwarding.
pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEvent>>,
    store: Option<Arc<dyn MachineStore>>,
}

impl EventLog {
    /// In-memory only.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            store: None,
        }
    }

    /// Also append each record to `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn MachineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Up to `limit` most recent records, newest first, optionally for one machine.
    pub fn recent(&self, limit: usize, machine_id: Option<&str>) -> Vec<AuditEvent> {
        self.entries
            .lock()
            .iter()
            .rev()
            .filter(|e| machine_id.map_or(true, |id| e.machine_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every retained record of `kind`, oldest first.
    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Retained record count.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn mirror(event: &AuditEvent) {
        let machine_id = event.machine_id.as_str();
        let kind = event.kind.as_str();
        match event.kind {
            AuditKind::Error => warn!(machine_id, kind, data = ?event.data, "{}", event.message),
            AuditKind::Ping => debug!(machine_id, kind, "{}", event.message),
            _ => info!(machine_id, kind, "{}", event.message),
        }
    }

    fn forward(&self, event: &AuditEvent) {
        let Some(store) = self.store.clone() else {
            return;
        };
        // No runtime (plain unit tests): skip persistence
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let event = event.clone();
        let _ = handle.spawn(async move {
            if let Err(e) = store.append_event(event).await {
                warn!(error = %e, "failed to persist audit event");
            }
        });
    }
}

impl EventSink for EventLog {
    fn record(&self, event: AuditEvent) {
        Self::mirror(&event);
        self.forward(&event);
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            let _ = entries.pop_front();
        }
        entries.push_back(event);
    }
}
