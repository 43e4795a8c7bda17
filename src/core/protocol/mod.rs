//! Chunked single-file transfer over an ordered, reliable channel.
//!
//! - [`message`]: wire encoding (JSON text frames, optional binary chunks)
//! - [`source`]: file-like inputs for the send path
//! - [`sender`]: metadata, chunks in ascending order, complete
//! - [`receiver`]: order-independent reassembly and completion checks
//!
//! No acknowledgements are exchanged; reliability is the channel's job.

pub mod message;
pub mod receiver;
pub mod sender;
pub mod source;

pub use message::{TransferMessage, WireFrame};
pub use receiver::ReceivedFile;
pub use source::{DiskFile, FileSource, MemoryFile};
