//! Outbound half of a participant's WebSocket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;
use uuid::Uuid;
use vendlink_core::protocol::OutboundFrame;

/// Handle to one connected participant (device or observer).
///
/// Frames are queued on a bounded channel drained by the session's writer
/// task. Closing the handle tells the session to send a Close frame and stop
/// reading.
pub struct PeerChannel {
    id: String,
    tx: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl PeerChannel {
    /// Wrap an existing sender.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: format!("chan_{}", Uuid::now_v7()),
            tx,
            closed: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a channel and the receiver its writer task drains.
    pub fn pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(tx)), rx)
    }

    /// Unique channel id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether `other` is the same underlying channel.
    pub fn same_as(&self, other: &PeerChannel) -> bool {
        self.id == other.id
    }

    /// Queue a pre-serialized frame.
    ///
    /// Returns `false` when the channel is closed or its queue is full, and
    /// counts the frame as dropped.
    pub fn send(&self, text: Arc<String>) -> bool {
        if !self.closed.is_cancelled() && self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue a frame.
    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match frame.to_text() {
            Ok(text) => self.send(Arc::new(text)),
            Err(e) => {
                warn!(channel_id = %self.id, error = %e, "failed to serialize frame");
                false
            }
        }
    }

    /// Ask the session to close the socket. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether frames can still be queued.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Token cancelled on close, for tasks that outlive a borrow.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
