//! Heartbeat scheduler.
//!
//! One timer for the whole fleet. Each tick evicts devices whose last
//! liveness signal is older than the timeout budget, then probes every
//! remaining open channel. Probe send failures are logged and left for a
//! later tick to decide.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

/// Result of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Probes queued.
    pub probed: usize,
    /// Machines removed for silence.
    pub evicted: Vec<String>,
    /// Probes that could not be queued.
    pub probe_failures: usize,
}

/// Drives periodic liveness sweeps over a [`ConnectionRegistry`].
pub struct HeartbeatScheduler {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatScheduler {
    /// Create a scheduler. `timeout` should span at least two intervals so
    /// one lost probe does not evict a device.
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    /// Sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Eviction budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one sweep now.
    pub fn tick(&self) -> SweepReport {
        let report = self.registry.sweep(self.timeout());
        debug!(
            probed = report.probed,
            evicted = report.evicted.len(),
            probe_failures = report.probe_failures,
            "heartbeat sweep"
        );
        report
    }

    /// Sweep every interval until `cancel` fires.
    ///
    /// The first sweep happens one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let period = self.interval();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            timeout_ms = u64::try_from(self.timeout().as_millis()).unwrap_or(u64::MAX),
            "heartbeat scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.tick();
                }
                () = cancel.cancelled() => {
                    info!("heartbeat scheduler stopped");
                    return;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use vendlink_core::ManualClock;
    use vendlink_core::status::AuditKind;

    use crate::channel::PeerChannel;
    use crate::events::EventLog;
    use crate::observers::ObserverHub;
    use crate::store::InMemoryMachineStore;

    const INTERVAL: Duration = Duration::from_secs(10);
    const TIMEOUT: Duration = Duration::from_secs(30);

    struct Fleet {
        registry: Arc<ConnectionRegistry>,
        scheduler: HeartbeatScheduler,
        events: Arc<EventLog>,
        clock: ManualClock,
    }

    fn fleet() -> Fleet {
        let events = Arc::new(EventLog::new(100));
        let clock = ManualClock::at_epoch();
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(ObserverHub::new()),
            events.clone(),
            Arc::new(InMemoryMachineStore::new()),
            Arc::new(clock.clone()),
        ));
        let scheduler = HeartbeatScheduler::new(registry.clone(), INTERVAL, TIMEOUT);
        Fleet {
            registry,
            scheduler,
            events,
            clock,
        }
    }

    fn frame_types(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let v: Value = serde_json::from_str(&text).unwrap();
            types.push(v["type"].as_str().unwrap_or_default().to_string());
        }
        types
    }

    #[test]
    fn tick_probes_open_channels() {
        let f = fleet();
        let (chan, mut rx) = PeerChannel::pair(8);
        f.registry.register(&chan, "M1").unwrap();
        let _ = frame_types(&mut rx);

        f.clock.advance(INTERVAL);
        let report = f.scheduler.tick();
        assert_eq!(report.probed, 1);
        assert!(report.evicted.is_empty());
        assert_eq!(frame_types(&mut rx), vec!["ping"]);
        assert_eq!(f.registry.awaiting_probe_response("M1"), Some(true));
    }

    #[test]
    fn silent_device_evicted_after_budget() {
        // registers at t=0, ignores probes at 10s and 20s, gone at 31s
        let f = fleet();
        let (chan, _rx) = PeerChannel::pair(8);
        f.registry.register(&chan, "M1").unwrap();

        for _ in 0..2 {
            f.clock.advance(INTERVAL);
            let report = f.scheduler.tick();
            assert!(report.evicted.is_empty());
            assert!(f.registry.status_of("M1").connected);
        }

        f.clock.advance(Duration::from_secs(11));
        let report = f.scheduler.tick();
        assert_eq!(report.evicted, vec!["M1".to_string()]);
        assert_eq!(report.probed, 0);
        assert!(!f.registry.status_of("M1").connected);
        assert!(!chan.is_open());

        let disconnects = f.events.of_kind(AuditKind::Disconnect);
        assert_eq!(disconnects.len(), 1);
        let data = disconnects[0].data.as_ref().unwrap();
        assert_eq!(data["reason"], "timeout");
        assert_eq!(data["lastHeartbeatAt"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn exactly_at_budget_is_not_evicted() {
        let f = fleet();
        let (chan, _rx) = PeerChannel::pair(8);
        f.registry.register(&chan, "M1").unwrap();
        f.clock.advance(TIMEOUT);
        let report = f.scheduler.tick();
        assert!(report.evicted.is_empty());
        assert!(f.registry.contains("M1"));
    }

    #[test]
    fn responsive_device_survives_many_cycles() {
        let f = fleet();
        let (chan, mut rx) = PeerChannel::pair(8);
        f.registry.register(&chan, "M1").unwrap();

        for _ in 0..50 {
            f.clock.advance(INTERVAL);
            let report = f.scheduler.tick();
            assert!(report.evicted.is_empty());
            let _ = frame_types(&mut rx);
            f.clock.advance(Duration::from_secs(2));
            assert!(f.registry.handle_probe_response("M1"));
        }
        assert!(f.registry.status_of("M1").connected);
        assert!(f.events.of_kind(AuditKind::Disconnect).is_empty());
    }

    #[test]
    fn late_response_after_eviction_is_ignored() {
        let f = fleet();
        let (chan, _rx) = PeerChannel::pair(8);
        f.registry.register(&chan, "M1").unwrap();
        f.clock.advance(Duration::from_secs(31));
        let _ = f.scheduler.tick();
        assert!(!f.registry.handle_probe_response("M1"));
        assert!(!f.registry.contains("M1"));
    }

    #[test]
    fn probe_failure_keeps_entry() {
        let f = fleet();
        let (chan, _rx) = PeerChannel::pair(1);
        f.registry.register(&chan, "M1").unwrap();
        // queue still holds the registration ack
        f.clock.advance(INTERVAL);
        let report = f.scheduler.tick();
        assert_eq!(report.probe_failures, 1);
        assert_eq!(report.probed, 0);
        assert!(f.registry.contains("M1"));
        assert_eq!(f.registry.awaiting_probe_response("M1"), Some(false));
    }

    #[test]
    fn closed_channel_is_not_probed() {
        let f = fleet();
        let (chan, _rx) = PeerChannel::pair(8);
        f.registry.register(&chan, "M1").unwrap();
        chan.close();
        f.clock.advance(INTERVAL);
        let report = f.scheduler.tick();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let f = fleet();
        let cancel = CancellationToken::new();
        let handle = f.scheduler.spawn(cancel.clone());
        time::sleep(INTERVAL * 3).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_probes_on_schedule() {
        let f = fleet();
        let (chan, mut rx) = PeerChannel::pair(16);
        f.registry.register(&chan, "M1").unwrap();
        let _ = frame_types(&mut rx);

        let cancel = CancellationToken::new();
        let handle = f.scheduler.spawn(cancel.clone());
        time::sleep(INTERVAL / 2).await;
        assert!(frame_types(&mut rx).is_empty());

        time::sleep(INTERVAL).await;
        assert_eq!(frame_types(&mut rx), vec!["ping"]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
