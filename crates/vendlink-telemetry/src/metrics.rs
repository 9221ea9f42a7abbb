//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Fails if a recorder is already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally.
///
/// Renders an empty exposition. Used when several servers share one process.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Device registrations accepted (counter).
pub const DEVICE_REGISTRATIONS_TOTAL: &str = "device_registrations_total";
/// Device channels closed or replaced (counter).
pub const DEVICE_DISCONNECTIONS_TOTAL: &str = "device_disconnections_total";
/// Devices evicted for missing the heartbeat budget (counter).
pub const DEVICE_TIMEOUTS_TOTAL: &str = "device_timeouts_total";
/// Probe frames enqueued (counter).
pub const HEARTBEAT_PROBES_TOTAL: &str = "heartbeat_probes_total";
/// Probe frames that could not be enqueued (counter).
pub const HEARTBEAT_PROBE_FAILURES_TOTAL: &str = "heartbeat_probe_failures_total";
/// Status frames an observer could not accept (counter).
pub const OBSERVER_BROADCAST_DROPS_TOTAL: &str = "observer_broadcast_drops_total";
/// Dispense attempts by classified outcome (counter, labels: outcome).
pub const DISPENSE_COMMANDS_TOTAL: &str = "dispense_commands_total";
/// Live device channels (gauge).
pub const DEVICES_CONNECTED: &str = "devices_connected";
/// Live observer channels (gauge).
pub const OBSERVERS_CONNECTED: &str = "observers_connected";
