//! # vendlink-core
//!
//! Shared vocabulary for the vendlink device channel:
//!
//! - **Protocol**: [`protocol::InboundFrame`] / [`protocol::OutboundFrame`], the
//!   JSON frames exchanged with devices and observers
//! - **Status**: [`status::DeviceStatus`], [`status::StatusEvent`] and the audit
//!   record [`status::AuditEvent`]
//! - **Errors**: [`errors::VendError`] via `thiserror`
//! - **Clock**: [`clock::Clock`] so liveness math can run on a manual clock in tests
//! - **Slots**: [`slot::parse_actuator_pin`] maps compartment names to actuator pins

#![deny(unsafe_code)]

pub mod clock;
pub mod errors;
pub mod protocol;
pub mod slot;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{Result, VendError};
pub use slot::parse_actuator_pin;
