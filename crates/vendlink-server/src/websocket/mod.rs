//! WebSocket transport for devices and observers.

pub mod session;

pub use session::{Role, handle_text, release, run_peer_session};
