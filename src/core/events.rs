//! Typed session events and the broadcast bus that carries them.
//!
//! Every state transition publishes a fresh [`SessionInfo`]; transfers
//! publish [`TransferStats`] on each chunk. Any number of subscribers may
//! listen; a subscriber that falls more than the bus capacity behind skips
//! the oldest events.

use crate::core::connection::SignalPayload;
use crate::core::error::SessionError;
use crate::core::protocol::ReceivedFile;
use crate::core::session::SessionInfo;
use crate::core::stats::TransferStats;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AbandonReason {
    /// A new `Metadata` arrived before `Complete`.
    Superseded,
    /// The connection went away mid-transfer.
    Disconnected,
    /// `Complete` arrived with missing chunks.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonedTransfer {
    pub file_name: String,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub reason: AbandonReason,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionInfo),
    /// Local signal payload ready to hand to the remote peer.
    Signal(SignalPayload),
    PeerConnected(SessionInfo),
    PeerDisconnected(SessionInfo),
    TransferProgress(TransferStats),
    FileReceived(ReceivedFile),
    TransferAbandoned(AbandonedTransfer),
    Error(SessionError),
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        if self.tx.send(event).is_err() {
            debug!(event = "event_dropped", "No subscribers for session event");
        }
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half of the session event bus.
pub struct EventStream {
    rx: broadcast::Receiver<SessionEvent>,
}

impl EventStream {
    /// Next event, or `None` once the manager is gone.
    ///
    /// Lagged subscribers skip the overwritten events and keep going.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(event = "subscriber_lagged", skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
