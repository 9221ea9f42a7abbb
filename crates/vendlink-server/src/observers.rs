//! Observer fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use tracing::{debug, warn};
use vendlink_core::protocol::{MachineUpdate, OutboundFrame};
use vendlink_core::status::{DeviceStatus, StatusEvent};
use vendlink_telemetry::metrics::{OBSERVER_BROADCAST_DROPS_TOTAL, OBSERVERS_CONNECTED};

use crate::channel::PeerChannel;

/// Acknowledgment text sent after the snapshot.
pub const SUBSCRIBED_MESSAGE: &str = "subscribed to machine updates";

/// The set of dashboard/monitor channels receiving status updates.
#[derive(Default)]
pub struct ObserverHub {
    observers: RwLock<HashMap<String, Arc<PeerChannel>>>,
}

impl ObserverHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer, then send it `snapshot` and the acknowledgment.
    ///
    /// Callers that need the snapshot to be consistent with concurrent
    /// broadcasts go through `ConnectionRegistry::subscribe_observer`.
    pub fn subscribe(&self, channel: Arc<PeerChannel>, snapshot: Vec<DeviceStatus>) {
        let machines = snapshot.len();
        let snapshot_sent = channel.send_frame(&OutboundFrame::MachineUpdate(MachineUpdate::Snapshot {
            machines: snapshot,
        }));
        let ack_sent = channel.send_frame(&OutboundFrame::Subscribed {
            message: SUBSCRIBED_MESSAGE.to_string(),
        });
        if !(snapshot_sent && ack_sent) {
            warn!(channel_id = %channel.id(), "failed to send subscription snapshot");
        }

        let mut observers = self.observers.write();
        let _ = observers.insert(channel.id().to_string(), channel);
        #[allow(clippy::cast_precision_loss)]
        gauge!(OBSERVERS_CONNECTED).set(observers.len() as f64);
        debug!(machines, observers = observers.len(), "observer subscribed");
    }

    /// Remove an observer. Returns whether it was present.
    pub fn unsubscribe(&self, channel_id: &str) -> bool {
        let mut observers = self.observers.write();
        let removed = observers.remove(channel_id).is_some();
        #[allow(clippy::cast_precision_loss)]
        gauge!(OBSERVERS_CONNECTED).set(observers.len() as f64);
        removed
    }

    /// Send a frame to every observer.
    ///
    /// The frame is serialized once. A failed send is logged and counted and
    /// never stops delivery to the remaining observers. Returns the number of
    /// observers that accepted the frame.
    pub fn broadcast(&self, frame: &OutboundFrame) -> usize {
        let json = match frame.to_text() {
            Ok(text) => Arc::new(text),
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast frame");
                return 0;
            }
        };
        let observers = self.observers.read();
        let mut delivered = 0;
        for observer in observers.values() {
            if observer.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                counter!(OBSERVER_BROADCAST_DROPS_TOTAL).increment(1);
                warn!(channel_id = %observer.id(), "failed to send update to observer");
            }
        }
        delivered
    }

    /// Broadcast one status transition.
    pub fn broadcast_status(&self, event: StatusEvent) -> usize {
        self.broadcast(&OutboundFrame::MachineUpdate(MachineUpdate::Change(event)))
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether there are no observers.
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}
