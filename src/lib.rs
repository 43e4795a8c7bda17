//! peerbeam: direct peer-to-peer file transfer over a data channel.
//!
//! The crate is split in two layers:
//!
//! - [`core::connection`] owns the peer connection and its state machine
//!   ([`ConnectionManager`]), behind the [`PeerFactory`] / [`PeerChannel`] seam.
//! - [`core::protocol`] frames, chunks and reassembles files on top of any
//!   ordered, reliable channel.
//!
//! Progress for both directions is derived in [`core::stats`] and published,
//! together with connection changes, on the typed [`core::events`] bus.

pub mod core;
pub mod utils;

pub use crate::core::config::{SessionConfig, TransferConfig, WireFormat};
pub use crate::core::connection::{
    ConnectionManager, LoopbackNetwork, PeerChannel, PeerEvent, PeerFactory, SignalPayload,
    WebRtcFactory,
};
pub use crate::core::error::SessionError;
pub use crate::core::events::{EventStream, SessionEvent};
pub use crate::core::protocol::{DiskFile, FileSource, MemoryFile, ReceivedFile, TransferMessage};
pub use crate::core::session::{ConnectionState, Role, SessionInfo};
pub use crate::core::stats::{Direction, TransferStats};
