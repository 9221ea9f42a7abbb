//! # vendlink-server
//!
//! Device health and command channel for a vending fleet.
//!
//! - [`registry`]: machine id → live device channel, presence transitions
//! - [`heartbeat`]: one fleet-wide timer that probes and evicts silent devices
//! - [`observers`]: status fan-out to dashboards with per-recipient isolation
//! - [`dispatch`]: fire-and-forget dispense commands with background outcome
//!   classification
//! - [`events`]: audit sink mirrored to `tracing` and the record store
//! - [`server`]: Axum routes for `/ws`, `/health`, `/metrics` and `/api/*`
//! - Graceful shutdown via [`shutdown::ShutdownCoordinator`]

#![deny(unsafe_code)]

pub mod channel;
pub mod dispatch;
pub mod events;
pub mod health;
pub mod heartbeat;
pub mod observers;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod websocket;

pub use channel::PeerChannel;
pub use dispatch::{CommandDispatcher, DispatchReport, DispenseItem, ReqwestTransport};
pub use events::{EventLog, EventSink};
pub use heartbeat::{HeartbeatScheduler, SweepReport};
pub use observers::ObserverHub;
pub use registry::ConnectionRegistry;
pub use server::{Services, VendServer};
pub use shutdown::ShutdownCoordinator;
pub use store::{InMemoryMachineStore, MachineRecord, MachineStore};
