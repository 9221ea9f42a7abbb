//! Error hierarchy shared by every vendlink crate.
//!
//! [`VendError`] covers the failures that can be decided without touching the
//! network: malformed frames, empty identifiers and slot labels that do not
//! resolve to an actuator. Transport and storage failures have their own
//! types in `vendlink-server` because they carry classification data.

use thiserror::Error;

/// Domain errors raised by core parsing and validation.
#[derive(Debug, Error)]
pub enum VendError {
    /// A slot label does not name an actuator.
    #[error("invalid slot '{slot}': {reason}")]
    InvalidSlot {
        /// The label as received.
        slot: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A dispense quantity was not a positive count that fits in a `u32`.
    #[error("invalid quantity {0}: must be a positive whole number")]
    InvalidQuantity(i64),

    /// A frame named an empty or whitespace-only machine id.
    #[error("machine id must not be empty")]
    EmptyMachineId,

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

impl VendError {
    /// Stable machine-readable code for API responses and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSlot { .. } => "INVALID_SLOT",
            Self::InvalidQuantity(_) => "INVALID_QUANTITY",
            Self::EmptyMachineId => "EMPTY_MACHINE_ID",
            Self::Frame(_) => "MALFORMED_FRAME",
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, VendError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
