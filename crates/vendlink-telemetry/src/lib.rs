//! # vendlink-telemetry
//!
//! Observability plumbing shared by the server and the binary:
//!
//! - [`init_subscriber`] installs the global `tracing` subscriber
//! - [`metrics`] installs the Prometheus recorder and names every metric
//! - [`test_utils`] captures tracing events in memory for assertions

#![deny(unsafe_code)]

pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use logging::init_subscriber;
pub use test_utils::{CapturedLogs, capture_logs};
