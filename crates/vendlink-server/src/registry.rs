//! Connection registry: machine id → live device channel.
//!
//! The registry is the only writer of device entries. Every mutation runs
//! under one lock and broadcasts/audits while still holding it, so events for
//! one device leave in the order the mutations happened. Observer snapshots
//! are taken under the same lock (see [`ConnectionRegistry::subscribe_observer`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};
use vendlink_core::Clock;
use vendlink_core::errors::VendError;
use vendlink_core::protocol::OutboundFrame;
use vendlink_core::status::{AuditEvent, AuditKind, DeviceStatus, StatusEvent};
use vendlink_telemetry::metrics::{
    DEVICE_DISCONNECTIONS_TOTAL, DEVICE_REGISTRATIONS_TOTAL, DEVICE_TIMEOUTS_TOTAL,
    DEVICES_CONNECTED, HEARTBEAT_PROBE_FAILURES_TOTAL, HEARTBEAT_PROBES_TOTAL,
};

use crate::channel::PeerChannel;
use crate::events::EventSink;
use crate::heartbeat::SweepReport;
use crate::observers::ObserverHub;
use crate::store::{MachineStore, PresenceUpdate};

/// Default: audit every 10th probe response.
pub const DEFAULT_PING_LOG_SAMPLE_EVERY: u64 = 10;

struct DeviceEntry {
    channel: Arc<PeerChannel>,
    last_heartbeat_at: DateTime<Utc>,
    /// `false` while a probe is outstanding.
    liveness: bool,
}

/// Live device connections.
pub struct ConnectionRegistry {
    devices: Mutex<HashMap<String, DeviceEntry>>,
    observers: Arc<ObserverHub>,
    events: Arc<dyn EventSink>,
    store: Arc<dyn MachineStore>,
    clock: Arc<dyn Clock>,
    probe_responses: AtomicU64,
    ping_log_sample_every: u64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(
        observers: Arc<ObserverHub>,
        events: Arc<dyn EventSink>,
        store: Arc<dyn MachineStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            observers,
            events,
            store,
            clock,
            probe_responses: AtomicU64::new(0),
            ping_log_sample_every: DEFAULT_PING_LOG_SAMPLE_EVERY,
        }
    }

    /// Audit every `n`th probe response. `0` disables ping auditing.
    #[must_use]
    pub fn with_ping_sampling(mut self, n: u64) -> Self {
        self.ping_log_sample_every = n;
        self
    }

    /// Register `channel` as the live connection for `machine_id`.
    ///
    /// A different channel already registered under the id is closed and
    /// replaced. If `channel` already owns an entry under another id, that
    /// entry is removed (and reported offline) without closing the channel.
    pub fn register(&self, channel: &Arc<PeerChannel>, machine_id: &str) -> Result<(), VendError> {
        if machine_id.trim().is_empty() {
            return Err(VendError::EmptyMachineId);
        }
        let now = self.clock.now();
        let mut devices = self.devices.lock();

        let renamed_from = devices
            .iter()
            .find(|(id, entry)| id.as_str() != machine_id && entry.channel.same_as(channel))
            .map(|(id, _)| id.clone());
        if let Some(old_id) = renamed_from {
            if let Some(old) = devices.remove(&old_id) {
                info!(machine_id = %old_id, new_machine_id = machine_id, "channel re-registered under a new id");
                self.report_offline(&old_id, old.last_heartbeat_at, now, "re-registered");
            }
        }

        if let Some(previous) = devices.remove(machine_id) {
            if !previous.channel.same_as(channel) {
                info!(
                    machine_id,
                    old_channel = %previous.channel.id(),
                    new_channel = %channel.id(),
                    "replacing existing device channel"
                );
                previous.channel.close();
                counter!(DEVICE_DISCONNECTIONS_TOTAL).increment(1);
            }
        }

        let _ = devices.insert(
            machine_id.to_string(),
            DeviceEntry {
                channel: Arc::clone(channel),
                last_heartbeat_at: now,
                liveness: true,
            },
        );

        let _ = self.observers.broadcast_status(StatusEvent::online(machine_id, now));
        self.events.record(
            AuditEvent::new(machine_id, AuditKind::Connect, "device connected", now)
                .with_data(json!({ "channelId": channel.id() })),
        );
        if !channel.send_frame(&OutboundFrame::Registered {
            machine_id: machine_id.to_string(),
        }) {
            warn!(machine_id, "failed to send registration ack");
        }

        counter!(DEVICE_REGISTRATIONS_TOTAL).increment(1);
        Self::set_gauge(devices.len());
        drop(devices);

        self.persist(machine_id, PresenceUpdate::online(now));
        Ok(())
    }

    /// Record a probe response. Returns `false` when no entry exists, e.g.
    /// the device was already evicted.
    pub fn handle_probe_response(&self, machine_id: &str) -> bool {
        let now = self.clock.now();
        let mut devices = self.devices.lock();
        let Some(entry) = devices.get_mut(machine_id) else {
            debug!(machine_id, "probe response for unregistered machine, ignoring");
            return false;
        };
        entry.last_heartbeat_at = now;
        entry.liveness = true;

        let _ = self.observers.broadcast_status(StatusEvent::online(machine_id, now));
        let n = self.probe_responses.fetch_add(1, Ordering::Relaxed) + 1;
        if self.ping_log_sample_every > 0 && n % self.ping_log_sample_every == 0 {
            self.events.record(AuditEvent::new(
                machine_id,
                AuditKind::Ping,
                "heartbeat received",
                now,
            ));
        }
        drop(devices);

        self.persist(machine_id, PresenceUpdate::online(now));
        true
    }

    /// Remove the entry owned by `channel` after its transport closed.
    ///
    /// Returns the machine id that was removed, if any. A channel that was
    /// already replaced or evicted owns nothing and produces no events.
    pub fn unregister(&self, channel: &PeerChannel) -> Option<String> {
        let now = self.clock.now();
        let mut devices = self.devices.lock();
        let machine_id = devices
            .iter()
            .find(|(_, entry)| entry.channel.same_as(channel))
            .map(|(id, _)| id.clone())?;
        let entry = devices.remove(&machine_id)?;
        self.report_offline(&machine_id, entry.last_heartbeat_at, now, "closed");
        counter!(DEVICE_DISCONNECTIONS_TOTAL).increment(1);
        Self::set_gauge(devices.len());
        Some(machine_id)
    }

    /// Current status of one machine. Pure read.
    pub fn status_of(&self, machine_id: &str) -> DeviceStatus {
        self.devices.lock().get(machine_id).map_or_else(
            || DeviceStatus::offline(machine_id),
            |entry| DeviceStatus::online(machine_id, entry.last_heartbeat_at),
        )
    }

    /// Status of every live entry, ordered by machine id.
    pub fn status_of_all(&self) -> Vec<DeviceStatus> {
        Self::snapshot(&self.devices.lock())
    }

    /// Add an observer and send it a snapshot consistent with every
    /// broadcast it will receive afterwards.
    pub fn subscribe_observer(&self, channel: Arc<PeerChannel>) {
        let devices = self.devices.lock();
        self.observers.subscribe(channel, Self::snapshot(&devices));
    }

    /// The live push channel for a machine.
    pub fn channel_for(&self, machine_id: &str) -> Option<Arc<PeerChannel>> {
        self.devices
            .lock()
            .get(machine_id)
            .map(|entry| Arc::clone(&entry.channel))
    }

    /// Whether a probe is outstanding for `machine_id`.
    pub fn awaiting_probe_response(&self, machine_id: &str) -> Option<bool> {
        self.devices.lock().get(machine_id).map(|entry| !entry.liveness)
    }

    /// Whether `machine_id` has a live entry.
    pub fn contains(&self, machine_id: &str) -> bool {
        self.devices.lock().contains_key(machine_id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    /// Whether there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// The observer hub this registry broadcasts to.
    pub fn observers(&self) -> &Arc<ObserverHub> {
        &self.observers
    }

    /// The audit sink this registry records to.
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// The clock liveness is measured with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// One heartbeat pass: evict every entry silent for longer than
    /// `timeout`, probe the rest.
    pub(crate) fn sweep(&self, timeout: Duration) -> SweepReport {
        let now = self.clock.now();
        let budget = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let mut report = SweepReport::default();
        let mut devices = self.devices.lock();

        let expired: Vec<String> = devices
            .iter()
            .filter(|(_, entry)| now.signed_duration_since(entry.last_heartbeat_at) > budget)
            .map(|(id, _)| id.clone())
            .collect();
        for machine_id in expired {
            let Some(entry) = devices.remove(&machine_id) else {
                continue;
            };
            let elapsed = now.signed_duration_since(entry.last_heartbeat_at);
            warn!(
                machine_id = %machine_id,
                elapsed_ms = elapsed.num_milliseconds(),
                "device missed heartbeat budget, evicting"
            );
            entry.channel.close();
            self.report_offline(&machine_id, entry.last_heartbeat_at, now, "timeout");
            counter!(DEVICE_TIMEOUTS_TOTAL).increment(1);
            report.evicted.push(machine_id);
        }

        let ping = OutboundFrame::ping(now);
        for (machine_id, entry) in devices.iter_mut() {
            if !entry.channel.is_open() {
                continue;
            }
            if entry.channel.send_frame(&ping) {
                entry.liveness = false;
                report.probed += 1;
                counter!(HEARTBEAT_PROBES_TOTAL).increment(1);
            } else {
                warn!(machine_id = %machine_id, "failed to send heartbeat probe");
                report.probe_failures += 1;
                counter!(HEARTBEAT_PROBE_FAILURES_TOTAL).increment(1);
            }
        }

        Self::set_gauge(devices.len());
        report
    }

    fn snapshot(devices: &HashMap<String, DeviceEntry>) -> Vec<DeviceStatus> {
        let mut all: Vec<DeviceStatus> = devices
            .iter()
            .map(|(id, entry)| DeviceStatus::online(id.as_str(), entry.last_heartbeat_at))
            .collect();
        all.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        all
    }

    /// Broadcast + audit + persist for an entry that just left the map.
    fn report_offline(
        &self,
        machine_id: &str,
        last_heartbeat_at: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: &str,
    ) {
        let _ = self.observers.broadcast_status(StatusEvent::offline(machine_id, now));
        let message = if reason == "timeout" {
            "device heartbeat timed out"
        } else {
            "device disconnected"
        };
        self.events.record(
            AuditEvent::new(machine_id, AuditKind::Disconnect, message, now).with_data(json!({
                "reason": reason,
                "lastHeartbeatAt": last_heartbeat_at,
            })),
        );
        self.persist(machine_id, PresenceUpdate::offline());
    }

    /// Best-effort presence write. Skipped outside a Tokio runtime.
    fn persist(&self, machine_id: &str, update: PresenceUpdate) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let machine_id = machine_id.to_string();
        let _ = handle.spawn(async move {
            if let Err(e) = store.update_presence(&machine_id, update).await {
                warn!(machine_id = %machine_id, error = %e, "failed to persist presence");
            }
        });
    }

    #[allow(clippy::cast_precision_loss)]
    fn set_gauge(len: usize) {
        gauge!(DEVICES_CONNECTED).set(len as f64);
    }
}
