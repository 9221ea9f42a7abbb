//! Command dispatcher.
//!
//! A dispense request is answered as soon as each item has been validated and
//! handed to the transport. The direct HTTP attempt runs detached on a
//! [`TaskTracker`]; its outcome only ever reaches the event sink and metrics.
//! When the device also holds a live push channel, a `dispense` frame is
//! queued on it as well.

pub mod outcome;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};
use vendlink_core::errors::VendError;
use vendlink_core::parse_actuator_pin;
use vendlink_core::protocol::OutboundFrame;
use vendlink_telemetry::metrics::DISPENSE_COMMANDS_TOTAL;

use crate::registry::ConnectionRegistry;
use crate::store::{MachineStore, StoreError};

pub use outcome::CommandOutcome;
pub use transport::{
    DirectCommand, DirectTransport, ReqwestTransport, TransportError, TransportErrorKind,
};

/// Acknowledgment text for an accepted item.
pub const COMMAND_SENT: &str = "command sent";

fn default_quantity() -> i64 {
    1
}

/// Labels arrive as text (`"D12"`) or as a bare pin number (`12`).
/// Anything else becomes an empty label and fails slot validation.
fn lenient_slot<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(slot) => slot,
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => String::new(),
    })
}

/// Non-integral or non-numeric quantities become 0 and fail validation.
fn lenient_quantity<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Null => default_quantity(),
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn lenient_machine_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(id) => Some(id),
        _ => None,
    })
}

/// Items that are not objects become an empty-slot item so they still get a row.
fn lenient_items<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<DispenseItem>, D::Error> {
    let raw = Vec::<Value>::deserialize(de)?;
    Ok(raw
        .into_iter()
        .map(|item| serde_json::from_value(item).unwrap_or_else(|_| DispenseItem::new("")))
        .collect())
}

/// One requested compartment.
///
/// Deserialization never fails on field values; bad slots and quantities
/// are rejected per item by the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispenseItem {
    /// Compartment label, e.g. `D12`.
    #[serde(default, deserialize_with = "lenient_slot")]
    pub slot: String,
    /// Units to release. Must be between 1 and `u32::MAX`.
    #[serde(default = "default_quantity", deserialize_with = "lenient_quantity")]
    pub quantity: i64,
    /// Target machine when it differs from the request's machine.
    #[serde(
        default,
        deserialize_with = "lenient_machine_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub machine_id: Option<String>,
}

impl DispenseItem {
    /// One unit from `slot`.
    pub fn new(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            quantity: 1,
            machine_id: None,
        }
    }

    /// Route this item to another machine.
    #[must_use]
    pub fn for_machine(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    /// Set the quantity.
    #[must_use]
    pub fn with_quantity(mut self, quantity: i64) -> Self {
        self.quantity = quantity;
        self
    }
}

/// Request body for `POST /api/machines/{id}/dispense`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DispenseRequest {
    /// Items to dispense.
    #[serde(default, deserialize_with = "lenient_items")]
    pub items: Vec<DispenseItem>,
}

/// Why an item was rejected before any attempt.
#[derive(Debug, Error)]
pub enum ItemError {
    /// No stored record for the machine.
    #[error("unknown machine '{0}'")]
    UnknownMachine(String),
    /// The stored record has no network address.
    #[error("machine '{0}' has no network address")]
    MissingAddress(String),
    /// Slot or quantity did not validate.
    #[error(transparent)]
    Invalid(#[from] VendError),
    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ItemError {
    /// Stable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownMachine(_) => "UNKNOWN_MACHINE",
            Self::MissingAddress(_) => "MISSING_ADDRESS",
            Self::Invalid(e) => e.code(),
            Self::Store(_) => "STORE_UNAVAILABLE",
        }
    }
}

/// Per-item row of a [`DispatchReport`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    /// Machine the item targeted.
    pub machine_id: String,
    /// Compartment label as requested.
    pub slot: String,
    /// Resolved actuator pin.
    pub pin: Option<u32>,
    /// Requested units.
    pub quantity: i64,
    /// Whether the command was handed to the transport.
    pub success: bool,
    /// Acknowledgment or error text.
    pub message: String,
    /// Error code when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Whether a `dispense` frame was also queued on the push channel.
    pub pushed: bool,
}

/// Response to a dispense request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Machine named by the request.
    pub machine_id: String,
    /// True when there is at least one row and every row succeeded.
    pub success: bool,
    /// One row per requested item, in request order.
    pub results: Vec<ItemResult>,
}

/// Accepted item, ready to send.
struct Accepted {
    machine_id: String,
    address: String,
    pin: u32,
    quantity: u32,
}

/// Issues dispense commands.
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MachineStore>,
    transport: Arc<dyn DirectTransport>,
    tasks: TaskTracker,
}

impl CommandDispatcher {
    /// Create a dispatcher. Events and time come from `registry`.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MachineStore>,
        transport: Arc<dyn DirectTransport>,
    ) -> Self {
        Self {
            registry,
            store,
            transport,
            tasks: TaskTracker::new(),
        }
    }

    /// Dispatch every item concurrently and report one row per item.
    #[instrument(skip_all, fields(machine_id = %machine_id, items = items.len()))]
    pub async fn dispatch(&self, machine_id: &str, items: Vec<DispenseItem>) -> DispatchReport {
        let results = join_all(items.into_iter().map(|item| self.dispatch_item(machine_id, item))).await;
        let success = !results.is_empty() && results.iter().all(|r| r.success);
        debug!(success, rows = results.len(), "dispatch complete");
        DispatchReport {
            machine_id: machine_id.to_string(),
            success,
            results,
        }
    }

    async fn dispatch_item(&self, default_machine: &str, item: DispenseItem) -> ItemResult {
        let machine_id = item
            .machine_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(default_machine)
            .to_string();

        let accepted = match self.accept(&machine_id, &item).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(machine_id = %machine_id, slot = %item.slot, code = e.code(), error = %e, "dispense item rejected");
                let pin = parse_actuator_pin(&item.slot).ok();
                return ItemResult {
                    machine_id,
                    slot: item.slot,
                    pin,
                    quantity: item.quantity,
                    success: false,
                    message: e.to_string(),
                    error_code: Some(e.code().to_string()),
                    pushed: false,
                };
            }
        };

        let pin = accepted.pin;
        let pushed = self.push(&accepted);
        self.send_direct(accepted);

        ItemResult {
            machine_id,
            slot: item.slot,
            pin: Some(pin),
            quantity: item.quantity,
            success: true,
            message: COMMAND_SENT.to_string(),
            error_code: None,
            pushed,
        }
    }

    async fn accept(&self, machine_id: &str, item: &DispenseItem) -> Result<Accepted, ItemError> {
        let quantity = u32::try_from(item.quantity)
            .ok()
            .filter(|q| *q > 0)
            .ok_or(VendError::InvalidQuantity(item.quantity))?;
        let pin = parse_actuator_pin(&item.slot)?;
        let record = self
            .store
            .machine(machine_id)
            .await?
            .ok_or_else(|| ItemError::UnknownMachine(machine_id.to_string()))?;
        let address = record
            .address
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ItemError::MissingAddress(machine_id.to_string()))?;
        Ok(Accepted {
            machine_id: machine_id.to_string(),
            address,
            pin,
            quantity,
        })
    }

    fn push(&self, accepted: &Accepted) -> bool {
        let Some(channel) = self.registry.channel_for(&accepted.machine_id) else {
            return false;
        };
        let frame = OutboundFrame::dispense(accepted.pin, accepted.quantity, self.registry.clock().now());
        let sent = channel.send_frame(&frame);
        if !sent {
            warn!(machine_id = %accepted.machine_id, "failed to queue dispense frame on push channel");
        }
        sent
    }

    fn send_direct(&self, accepted: Accepted) {
        let transport = Arc::clone(&self.transport);
        let events = Arc::clone(self.registry.events());
        let clock = Arc::clone(self.registry.clock());
        let _ = self.tasks.spawn(async move {
            let Accepted {
                machine_id,
                address,
                pin,
                quantity,
            } = accepted;
            let result = transport
                .send(&address, DirectCommand { slot: pin, quantity })
                .await;
            let outcome = CommandOutcome::classify(result);
            if outcome.is_failure() {
                warn!(machine_id = %machine_id, pin, outcome = outcome.label(), "dispense attempt failed");
            } else {
                debug!(machine_id = %machine_id, pin, outcome = outcome.label(), "dispense attempt finished");
            }
            counter!(DISPENSE_COMMANDS_TOTAL, "outcome" => outcome.label()).increment(1);
            events.record(outcome.to_audit(&machine_id, pin, quantity, clock.now()));
        });
    }

    /// Background attempts still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every background attempt has completed.
    pub async fn settle(&self) {
        let _ = self.tasks.close();
        self.tasks.wait().await;
        let _ = self.tasks.reopen();
    }

    /// Stop accepting and wait up to `timeout` for in-flight attempts.
    /// Returns whether everything completed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let _ = self.tasks.close();
        tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use vendlink_core::ManualClock;
    use vendlink_core::status::AuditKind;

    use crate::channel::PeerChannel;
    use crate::events::EventLog;
    use crate::observers::ObserverHub;
    use crate::store::{InMemoryMachineStore, MachineRecord};

    /// Replies per address; unknown addresses succeed.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<HashMap<String, TransportError>>,
        calls: Mutex<Vec<(String, DirectCommand)>>,
    }

    impl ScriptedTransport {
        fn fail(&self, address: &str, kind: TransportErrorKind, code: &str) {
            let _ = self
                .replies
                .lock()
                .insert(address.to_string(), TransportError::new(kind, code, "scripted"));
        }

        fn calls(&self) -> Vec<(String, DirectCommand)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl DirectTransport for ScriptedTransport {
        async fn send(&self, address: &str, command: DirectCommand) -> Result<(), TransportError> {
            self.calls.lock().push((address.to_string(), command));
            match self.replies.lock().get(address) {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    struct Harness {
        dispatcher: CommandDispatcher,
        registry: Arc<ConnectionRegistry>,
        transport: Arc<ScriptedTransport>,
        events: Arc<EventLog>,
    }

    fn harness(records: Vec<MachineRecord>) -> Harness {
        let store = Arc::new(InMemoryMachineStore::with_machines(records));
        let events = Arc::new(EventLog::new(100));
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(ObserverHub::new()),
            events.clone(),
            store.clone(),
            Arc::new(ManualClock::at_epoch()),
        ));
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = CommandDispatcher::new(registry.clone(), store, transport.clone());
        Harness {
            dispatcher,
            registry,
            transport,
            events,
        }
    }

    fn m1() -> MachineRecord {
        MachineRecord::new("M1", Some("10.0.0.5:8080"))
    }

    #[tokio::test]
    async fn good_and_bad_slot_in_one_request() {
        let h = harness(vec![m1()]);
        let report = h
            .dispatcher
            .dispatch("M1", vec![DispenseItem::new("D12"), DispenseItem::new("BAD")])
            .await;
        h.dispatcher.settle().await;

        assert_eq!(report.results.len(), 2);
        assert!(!report.success);
        let first = &report.results[0];
        assert!(first.success);
        assert_eq!(first.pin, Some(12));
        assert_eq!(first.message, COMMAND_SENT);
        let second = &report.results[1];
        assert!(!second.success);
        assert_eq!(second.error_code.as_deref(), Some("INVALID_SLOT"));

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, DirectCommand { slot: 12, quantity: 1 });
    }

    #[tokio::test]
    async fn digitless_slot_makes_no_attempt() {
        let h = harness(vec![m1()]);
        for slot in ["", "BAD", "slot-x"] {
            let report = h.dispatcher.dispatch("M1", vec![DispenseItem::new(slot)]).await;
            assert!(!report.results[0].success);
        }
        h.dispatcher.settle().await;
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_address_fails_without_attempt() {
        let h = harness(vec![MachineRecord::new("M1", None)]);
        let report = h.dispatcher.dispatch("M1", vec![DispenseItem::new("A1")]).await;
        h.dispatcher.settle().await;
        assert_eq!(report.results[0].error_code.as_deref(), Some("MISSING_ADDRESS"));
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn only_the_unresolvable_item_fails() {
        let h = harness(vec![m1(), MachineRecord::new("M3", None)]);
        let items = vec![
            DispenseItem::new("A1"),
            DispenseItem::new("A2").for_machine("M2"),
            DispenseItem::new("A3").for_machine("M3"),
            DispenseItem::new("A4"),
        ];
        let report = h.dispatcher.dispatch("M1", items).await;
        h.dispatcher.settle().await;

        let flags: Vec<bool> = report.results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, false, false, true]);
        assert_eq!(report.results[1].error_code.as_deref(), Some("UNKNOWN_MACHINE"));
        assert_eq!(report.results[2].error_code.as_deref(), Some("MISSING_ADDRESS"));
        assert_eq!(report.results[1].machine_id, "M2");
        assert_eq!(h.transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected() {
        let h = harness(vec![m1()]);
        let report = h
            .dispatcher
            .dispatch("M1", vec![DispenseItem::new("A1").with_quantity(0)])
            .await;
        assert_eq!(report.results[0].error_code.as_deref(), Some("INVALID_QUANTITY"));
    }

    #[tokio::test]
    async fn empty_request_is_not_success() {
        let h = harness(vec![m1()]);
        let report = h.dispatcher.dispatch("M1", Vec::new()).await;
        assert!(!report.success);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn connected_device_also_gets_push_frame() {
        let h = harness(vec![m1()]);
        let (chan, mut rx) = PeerChannel::pair(8);
        h.registry.register(&chan, "M1").unwrap();
        let _ = rx.try_recv();

        let report = h
            .dispatcher
            .dispatch("M1", vec![DispenseItem::new("D12").with_quantity(2)])
            .await;
        assert!(report.results[0].pushed);
        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "dispense");
        assert_eq!(frame["slot"], 12);
        assert_eq!(frame["quantity"], 2);
    }

    #[tokio::test]
    async fn outcomes_reach_event_sink() {
        let h = harness(vec![
            MachineRecord::new("OK", Some("ok:80")),
            MachineRecord::new("SLOW", Some("slow:80")),
            MachineRecord::new("DOWN", Some("down:80")),
            MachineRecord::new("NODNS", Some("nodns:80")),
        ]);
        h.transport.fail("slow:80", TransportErrorKind::Timeout, "ETIMEDOUT");
        h.transport.fail("down:80", TransportErrorKind::Refused, "ECONNREFUSED");
        h.transport.fail("nodns:80", TransportErrorKind::Unreachable, "ENOTFOUND");

        let items = ["OK", "SLOW", "DOWN", "NODNS"]
            .into_iter()
            .map(|m| DispenseItem::new("A1").for_machine(m))
            .collect();
        let report = h.dispatcher.dispatch("OK", items).await;
        // the caller sees success before outcomes are known
        assert!(report.success);
        h.dispatcher.settle().await;

        let mut sent: Vec<String> = h
            .events
            .of_kind(AuditKind::Dispense)
            .into_iter()
            .map(|e| e.machine_id)
            .collect();
        sent.sort();
        assert_eq!(sent, vec!["OK", "SLOW"]);

        let errors = h.events.of_kind(AuditKind::Error);
        assert_eq!(errors.len(), 2);
        let down = errors.iter().find(|e| e.machine_id == "DOWN").unwrap();
        assert_eq!(down.data.as_ref().unwrap()["outcome"], "offline");
        let nodns = errors.iter().find(|e| e.machine_id == "NODNS").unwrap();
        assert_eq!(nodns.data.as_ref().unwrap()["outcome"], "network");
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight() {
        let h = harness(vec![m1()]);
        let _ = h.dispatcher.dispatch("M1", vec![DispenseItem::new("A1")]).await;
        assert!(h.dispatcher.drain(Duration::from_secs(1)).await);
        assert_eq!(h.dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn out_of_range_quantities_are_rejected() {
        let h = harness(vec![m1()]);
        let items = vec![
            DispenseItem::new("A1").with_quantity(-1),
            DispenseItem::new("A2").with_quantity(i64::from(u32::MAX) + 1),
            DispenseItem::new("A3").with_quantity(3),
        ];
        let report = h.dispatcher.dispatch("M1", items).await;
        h.dispatcher.settle().await;
        let codes: Vec<_> = report.results.iter().map(|r| r.error_code.as_deref()).collect();
        assert_eq!(codes, vec![Some("INVALID_QUANTITY"), Some("INVALID_QUANTITY"), None]);
        assert_eq!(h.transport.calls()[0].1, DirectCommand { slot: 3, quantity: 3 });
    }

    #[test]
    fn item_defaults_quantity() {
        let item: DispenseItem = serde_json::from_str(r#"{"slot":"D12"}"#).unwrap();
        assert_eq!(item.quantity, 1);
        assert!(item.machine_id.is_none());
    }

    #[test]
    fn numeric_slot_is_accepted() {
        let item: DispenseItem = serde_json::from_str(r#"{"slot":7,"quantity":2}"#).unwrap();
        assert_eq!(item.slot, "7");
        assert_eq!(item.quantity, 2);
    }

    #[test]
    fn bad_item_fields_still_parse() {
        let request: DispenseRequest = serde_json::from_str(
            r#"{"items":[{},{"slot":"A1","quantity":-1},{"slot":true,"quantity":"x"},5,{"slot":"B2","quantity":null,"machineId":4}]}"#,
        )
        .unwrap();
        let items = request.items;
        assert_eq!(items.len(), 5);
        assert_eq!(items[0], DispenseItem::new(""));
        assert_eq!(items[1].quantity, -1);
        assert_eq!((items[2].slot.as_str(), items[2].quantity), ("", 0));
        assert_eq!(items[3], DispenseItem::new(""));
        assert_eq!(items[4], DispenseItem::new("B2"));
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = DispatchReport {
            machine_id: "M1".into(),
            success: true,
            results: vec![ItemResult {
                machine_id: "M1".into(),
                slot: "D12".into(),
                pin: Some(12),
                quantity: 1,
                success: true,
                message: COMMAND_SENT.into(),
                error_code: None,
                pushed: false,
            }],
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["machineId"], "M1");
        assert_eq!(v["results"][0]["pin"], 12);
        assert!(v["results"][0].get("errorCode").is_none());
    }
}
