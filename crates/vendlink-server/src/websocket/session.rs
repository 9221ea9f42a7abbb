//! One WebSocket peer from upgrade through disconnect.
//!
//! A peer starts without a role. Its first `register` makes it a device
//! channel, its first `subscribe` an observer channel. Frames that do not
//! fit the current role are logged and dropped; the socket stays open.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use vendlink_core::protocol::InboundFrame;
use vendlink_core::status::{AuditEvent, AuditKind};

use crate::channel::PeerChannel;
use crate::registry::ConnectionRegistry;

/// How long cleanup waits for the outbound forwarder to flush.
const FORWARDER_GRACE: Duration = Duration::from_secs(1);

/// What a peer has declared itself to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Nothing declared yet.
    Pending,
    /// Registered device.
    Device(String),
    /// Status subscriber.
    Observer,
}

impl Role {
    /// Label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Device(_) => "device",
            Self::Observer => "observer",
        }
    }
}

/// Apply one inbound text frame.
pub fn handle_text(
    text: &str,
    role: &mut Role,
    channel: &Arc<PeerChannel>,
    registry: &ConnectionRegistry,
) {
    let frame = match InboundFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, code = e.code(), len = text.len(), "ignoring inbound frame");
            return;
        }
    };
    debug!(kind = frame.kind(), role = role.label(), "inbound frame");

    match frame {
        InboundFrame::Register { machine_id } => {
            if *role == Role::Observer {
                warn!(machine_id = %machine_id, "observer tried to register; ignored");
                return;
            }
            match registry.register(channel, &machine_id) {
                Ok(()) => *role = Role::Device(machine_id),
                Err(e) => warn!(error = %e, "registration rejected"),
            }
        }
        InboundFrame::Subscribe => match role {
            Role::Pending => {
                registry.subscribe_observer(Arc::clone(channel));
                *role = Role::Observer;
            }
            Role::Observer => debug!("duplicate subscribe ignored"),
            Role::Device(id) => warn!(machine_id = %id, "device tried to subscribe; ignored"),
        },
        InboundFrame::Pong { machine_id } => match role {
            Role::Device(id) if *id == machine_id => {
                if !registry.handle_probe_response(&machine_id) {
                    debug!(machine_id = %machine_id, "probe response for evicted device");
                }
            }
            _ => debug!(machine_id = %machine_id, role = role.label(), "unexpected pong ignored"),
        },
        InboundFrame::Log {
            machine_id,
            message,
        } => match role {
            Role::Device(id) if *id == machine_id => {
                let at = registry.clock().now();
                registry
                    .events()
                    .record(AuditEvent::new(machine_id, AuditKind::Info, message, at));
            }
            _ => debug!(machine_id = %machine_id, role = role.label(), "log frame from non-device ignored"),
        },
    }
}

/// Release whatever `role` holds in the registry and close the channel.
pub fn release(role: &Role, channel: &PeerChannel, registry: &ConnectionRegistry) {
    match role {
        Role::Device(_) => {
            let _ = registry.unregister(channel);
        }
        Role::Observer => {
            let _ = registry.observers().unsubscribe(channel.id());
        }
        Role::Pending => {}
    }
    channel.close();
}

/// Drive a peer until either side closes.
///
/// Outbound frames are written by a forwarder task draining `rx`. When the
/// server closes the channel (eviction or replacement) the forwarder flushes
/// what is queued and sends a Close frame.
#[instrument(skip_all, fields(channel_id = %channel.id()))]
pub async fn run_peer_session(
    ws: WebSocket,
    channel: Arc<PeerChannel>,
    mut rx: mpsc::Receiver<Arc<String>>,
    registry: Arc<ConnectionRegistry>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    info!("peer connected");

    let close = channel.close_token();
    let mut outbound = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                () = close.cancelled() => {
                    while let Ok(text) = rx.try_recv() {
                        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut role = Role::Pending;
    loop {
        let next = tokio::select! {
            msg = ws_rx.next() => msg,
            () = channel.closed() => {
                debug!("channel closed by server");
                break;
            }
        };
        let Some(Ok(msg)) = next else { break };

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(s) => s.to_string(),
                Err(_) => {
                    debug!(len = data.len(), "dropping non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("peer sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        handle_text(&text, &mut role, &channel, &registry);
    }

    release(&role, &channel, &registry);
    if tokio::time::timeout(FORWARDER_GRACE, &mut outbound).await.is_err() {
        outbound.abort();
    }
    info!(role = role.label(), drops = channel.drop_count(), "peer disconnected");
}
