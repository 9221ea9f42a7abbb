//! Compartment name → actuator pin mapping.
//!
//! Compartments are labelled by the operator (`"D12"`, `"slot-3"`, `"A07"`).
//! The controller only understands numeric actuator ids, taken from the first
//! contiguous run of ASCII digits in the label.

use crate::errors::VendError;

/// Extract the actuator pin from a compartment label.
///
/// Returns [`VendError::InvalidSlot`] when the label contains no digit or the
/// digit run does not fit in a `u32`.
pub fn parse_actuator_pin(label: &str) -> Result<u32, VendError> {
    let digits: String = label
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();

    if digits.is_empty() {
        return Err(VendError::InvalidSlot {
            slot: label.to_string(),
            reason: "no digits in slot name".into(),
        });
    }

    digits.parse::<u32>().map_err(|e| VendError::InvalidSlot {
        slot: label.to_string(),
        reason: format!("pin out of range: {e}"),
    })
}
