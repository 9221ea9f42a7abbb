//! Background classification of a direct dispense attempt.

use chrono::{DateTime, Utc};
use serde_json::json;
use vendlink_core::status::{AuditEvent, AuditKind};

use super::transport::{TransportError, TransportErrorKind};

/// How a direct dispense attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Controller replied with 2xx.
    Sent,
    /// No reply within the bounded wait. Logged as sent: controllers reply
    /// only after the motor stops. Assumed, not confirmed.
    SentTimeout,
    /// Controller refused the connection.
    Offline(TransportError),
    /// Address did not resolve or no route to it.
    Network(TransportError),
    /// Any other failure.
    Unknown(TransportError),
}

impl CommandOutcome {
    /// Classify a transport result.
    pub fn classify(result: Result<(), TransportError>) -> Self {
        match result {
            Ok(()) => Self::Sent,
            Err(e) => match e.kind {
                TransportErrorKind::Timeout => Self::SentTimeout,
                TransportErrorKind::Refused => Self::Offline(e),
                TransportErrorKind::Unreachable => Self::Network(e),
                TransportErrorKind::Other => Self::Unknown(e),
            },
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::SentTimeout => "sent_timeout",
            Self::Offline(_) => "offline",
            Self::Network(_) => "network",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Whether the attempt is logged as a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Offline(_) | Self::Network(_) | Self::Unknown(_))
    }

    /// Audit record for this outcome.
    pub fn to_audit(
        &self,
        machine_id: &str,
        pin: u32,
        quantity: u32,
        at: DateTime<Utc>,
    ) -> AuditEvent {
        let (kind, message, data) = match self {
            Self::Sent => (
                AuditKind::Dispense,
                format!("dispense sent: pin {pin} x{quantity}"),
                json!({ "pin": pin, "quantity": quantity, "outcome": self.label() }),
            ),
            Self::SentTimeout => (
                AuditKind::Dispense,
                format!("dispense sent: pin {pin} x{quantity} (controller reply timed out)"),
                json!({
                    "pin": pin,
                    "quantity": quantity,
                    "outcome": self.label(),
                    "assumedDelivered": true,
                }),
            ),
            Self::Offline(e) => (
                AuditKind::Error,
                format!("dispense failed: controller offline ({})", e.code),
                failure_data(pin, quantity, self.label(), e),
            ),
            Self::Network(e) => (
                AuditKind::Error,
                format!("dispense failed: network configuration error ({})", e.code),
                failure_data(pin, quantity, self.label(), e),
            ),
            Self::Unknown(e) => (
                AuditKind::Error,
                format!("dispense failed: {e}"),
                failure_data(pin, quantity, self.label(), e),
            ),
        };
        AuditEvent::new(machine_id, kind, message, at).with_data(data)
    }
}

fn failure_data(pin: u32, quantity: u32, outcome: &str, e: &TransportError) -> serde_json::Value {
    json!({
        "pin": pin,
        "quantity": quantity,
        "outcome": outcome,
        "code": e.code,
        "error": e.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: TransportErrorKind, code: &str) -> Result<(), TransportError> {
        Err(TransportError::new(kind, code, "boom"))
    }

    #[test]
    fn ok_is_sent() {
        assert_eq!(CommandOutcome::classify(Ok(())), CommandOutcome::Sent);
    }

    #[test]
    fn timeout_counts_as_sent() {
        // policy assumption: slow controllers usually did dispense
        let outcome = CommandOutcome::classify(err(TransportErrorKind::Timeout, "ETIMEDOUT"));
        assert_eq!(outcome, CommandOutcome::SentTimeout);
        assert!(!outcome.is_failure());
        let audit = outcome.to_audit("M1", 12, 1, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(audit.kind, AuditKind::Dispense);
        assert_eq!(audit.data.unwrap()["assumedDelivered"], true);
    }

    #[test]
    fn refused_is_offline_error() {
        let outcome = CommandOutcome::classify(err(TransportErrorKind::Refused, "ECONNREFUSED"));
        assert_eq!(outcome.label(), "offline");
        let audit = outcome.to_audit("M1", 3, 2, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(audit.kind, AuditKind::Error);
        assert!(audit.message.contains("offline"));
        assert_eq!(audit.data.unwrap()["code"], "ECONNREFUSED");
    }

    #[test]
    fn unreachable_is_network_error() {
        let outcome = CommandOutcome::classify(err(TransportErrorKind::Unreachable, "ENOTFOUND"));
        assert_eq!(outcome.label(), "network");
        let audit = outcome.to_audit("M1", 3, 1, DateTime::<Utc>::UNIX_EPOCH);
        assert!(audit.message.contains("network configuration"));
    }

    #[test]
    fn other_keeps_raw_code() {
        let outcome = CommandOutcome::classify(err(TransportErrorKind::Other, "HTTP_500"));
        assert!(outcome.is_failure());
        let audit = outcome.to_audit("M1", 3, 1, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(audit.message, "dispense failed: HTTP_500: boom");
    }
}
