//! Peer connection layer.
//!
//! A [`PeerFactory`] opens one [`PeerChannel`] per session attempt, in the
//! initiator or responder role, together with the stream of [`PeerEvent`]s
//! that channel produces. The [`ConnectionManager`] drives that stream; it
//! never sees which primitive sits underneath.
//!
//! Event contract every primitive follows:
//! - `Signal` once the local payload is ready (initiator: right after open,
//!   responder: after the remote offer was accepted)
//! - `Connect` when the data channel opens
//! - `Data` for every inbound frame, in order
//! - `Close` when the remote side goes away
//! - `Error` on transport failure

pub mod loopback;
pub mod manager;
pub mod signal;
pub mod webrtc;

pub use loopback::LoopbackNetwork;
pub use manager::ConnectionManager;
pub use signal::SignalPayload;
pub use webrtc::WebRtcFactory;

use crate::core::protocol::WireFrame;
use crate::core::session::Role;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Signal(SignalPayload),
    Connect,
    Data(Bytes),
    Close,
    Error(String),
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// One ordered, reliable data channel to a single remote peer.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Apply the remote side's signal payload.
    async fn accept_signal(&self, signal: SignalPayload) -> Result<()>;

    async fn send(&self, frame: WireFrame) -> Result<()>;

    /// Bytes queued locally and not yet handed to the transport.
    async fn buffered_amount(&self) -> usize;

    /// Tear the channel down. Safe to call more than once.
    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn open(&self, role: Role) -> Result<(Arc<dyn PeerChannel>, PeerEvents)>;
}
