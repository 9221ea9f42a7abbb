//! Direct HTTP path to a device controller.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use vendlink_settings::DispatchSettings;

/// Body posted to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DirectCommand {
    /// Actuator pin.
    pub slot: u32,
    /// Units to release.
    pub quantity: u32,
}

/// Transport-level failure category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// No reply within the bounded wait.
    Timeout,
    /// The controller actively refused the connection.
    Refused,
    /// Name resolution failed or no route to the host.
    Unreachable,
    /// Anything else, including non-2xx replies.
    Other,
}

/// A failed direct request.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    /// Category used for outcome classification.
    pub kind: TransportErrorKind,
    /// Raw identifier (`ECONNREFUSED`, `HTTP_500`, ...).
    pub code: String,
    /// Underlying error text.
    pub message: String,
}

impl TransportError {
    /// Build an error.
    pub fn new(kind: TransportErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Sends a command straight to a controller's network address.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Deliver `command` to `address`. Resolves once the controller replied
    /// or the bounded wait expired.
    async fn send(&self, address: &str, command: DirectCommand) -> Result<(), TransportError>;
}

/// [`DirectTransport`] backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    command_path: String,
    default_scheme: String,
}

impl ReqwestTransport {
    /// Build from dispatch settings.
    pub fn new(settings: &DispatchSettings) -> Self {
        Self::with_timeout(
            settings.request_timeout(),
            &settings.command_path,
            &settings.default_scheme,
        )
    }

    /// Build with explicit parameters.
    pub fn with_timeout(timeout: Duration, command_path: &str, default_scheme: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("vendlink/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            command_path: command_path.to_string(),
            default_scheme: default_scheme.to_string(),
        }
    }

    /// Full URL for a stored address.
    pub fn command_url(&self, address: &str) -> String {
        let address = address.trim().trim_end_matches('/');
        if address.contains("://") {
            format!("{address}{}", self.command_path)
        } else {
            format!("{}://{address}{}", self.default_scheme, self.command_path)
        }
    }
}

#[async_trait]
impl DirectTransport for ReqwestTransport {
    async fn send(&self, address: &str, command: DirectCommand) -> Result<(), TransportError> {
        let url = self.command_url(address);
        let response = self
            .client
            .post(&url)
            .json(&command)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::new(
                TransportErrorKind::Other,
                format!("HTTP_{}", status.as_u16()),
                format!("controller at {url} replied {status}"),
            ))
        }
    }
}

/// Map a `reqwest` failure onto a [`TransportError`].
pub fn classify_reqwest(err: &reqwest::Error) -> TransportError {
    let chain = error_chain(err);
    let (kind, code) = classify(err.is_timeout(), io_kind(err), err.is_connect(), &chain);
    TransportError::new(kind, code, chain)
}

/// Decide the failure category from the pieces a transport error exposes.
pub fn classify(
    is_timeout: bool,
    io_kind: Option<std::io::ErrorKind>,
    is_connect: bool,
    chain: &str,
) -> (TransportErrorKind, &'static str) {
    use std::io::ErrorKind;

    if is_timeout || io_kind == Some(ErrorKind::TimedOut) {
        return (TransportErrorKind::Timeout, "ETIMEDOUT");
    }
    if io_kind == Some(ErrorKind::ConnectionRefused) {
        return (TransportErrorKind::Refused, "ECONNREFUSED");
    }
    let lower = chain.to_ascii_lowercase();
    if lower.contains("connection refused") {
        return (TransportErrorKind::Refused, "ECONNREFUSED");
    }
    if lower.contains("dns error")
        || lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
    {
        return (TransportErrorKind::Unreachable, "ENOTFOUND");
    }
    if lower.contains("unreachable") || lower.contains("no route to host") {
        return (TransportErrorKind::Unreachable, "EHOSTUNREACH");
    }
    if is_connect {
        (TransportErrorKind::Other, "ECONNECT")
    } else {
        (TransportErrorKind::Other, "EREQUEST")
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !parts.iter().any(|p| p == &text) {
            parts.push(text);
        }
        source = cause.source();
    }
    parts.join(": ")
}

fn io_kind(err: &(dyn StdError + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}
