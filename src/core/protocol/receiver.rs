//! Inbound transfer reassembly.
//!
//! At most one [`InboundTransfer`] is live at a time. Chunks are keyed by
//! index in a `BTreeMap`, so arrival order does not matter and reassembly is
//! a single ascending walk. Duplicate indices overwrite.

use crate::core::config::TransferConfig;
use crate::core::error::SessionError;
use crate::core::events::{AbandonReason, AbandonedTransfer};
use crate::core::protocol::TransferMessage;
use crate::core::stats::{Direction, StatsTracker, TransferStats};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedFile {
    pub file_name: String,
    #[serde(skip)]
    pub data: Bytes,
}

/// What happened to one inbound message.
#[derive(Debug)]
pub(crate) enum ReceiveOutcome {
    /// `Metadata` opened a new transfer, possibly replacing an older one.
    Started {
        stats: TransferStats,
        superseded: Option<AbandonedTransfer>,
    },
    Progress(TransferStats),
    Completed {
        file: ReceivedFile,
        stats: TransferStats,
    },
    /// The message was dropped. `abandoned` is set when doing so also
    /// discarded the active transfer.
    Rejected {
        error: SessionError,
        abandoned: Option<AbandonedTransfer>,
    },
    /// `Chunk` or `Complete` with no active transfer.
    Ignored,
}

#[derive(Debug)]
struct InboundTransfer {
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    chunks: BTreeMap<u32, Bytes>,
    received_bytes: u64,
    stats: StatsTracker,
}

impl InboundTransfer {
    fn abandoned(self, reason: AbandonReason) -> AbandonedTransfer {
        AbandonedTransfer {
            file_name: self.file_name,
            bytes_received: self.received_bytes,
            total_bytes: self.file_size,
            reason,
        }
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() as u64 == self.total_chunks as u64
            && self.received_bytes == self.file_size
    }

    fn assemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.received_bytes as usize);
        for data in self.chunks.values() {
            buf.extend_from_slice(data);
        }
        buf.freeze()
    }
}

#[derive(Debug)]
pub(crate) struct TransferReceiver {
    config: TransferConfig,
    current: Option<InboundTransfer>,
}

impl TransferReceiver {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn handle(&mut self, msg: TransferMessage) -> ReceiveOutcome {
        match msg {
            TransferMessage::Metadata {
                file_name,
                file_size,
                total_chunks,
            } => self.on_metadata(file_name, file_size, total_chunks),
            TransferMessage::Chunk { index, data } => self.on_chunk(index, data),
            TransferMessage::Complete => self.on_complete(),
        }
    }

    /// Drop the active transfer, if any.
    pub fn abandon(&mut self, reason: AbandonReason) -> Option<AbandonedTransfer> {
        let transfer = self.current.take()?;
        warn!(
            event = "transfer_abandoned",
            file = %transfer.file_name,
            received = transfer.received_bytes,
            total = transfer.file_size,
            ?reason,
            "Inbound transfer abandoned"
        );
        Some(transfer.abandoned(reason))
    }

    fn on_metadata(&mut self, file_name: String, file_size: u64, total_chunks: u32) -> ReceiveOutcome {
        let superseded = self.abandon(AbandonReason::Superseded);

        if file_size > self.config.max_file_size {
            return ReceiveOutcome::Rejected {
                error: SessionError::FileTooLarge {
                    file_name,
                    size: file_size,
                    limit: self.config.max_file_size,
                },
                abandoned: superseded,
            };
        }

        info!(
            event = "receive_started",
            file = %file_name,
            size = file_size,
            chunks = total_chunks,
            "Receiving file"
        );

        let stats = StatsTracker::new(Direction::Receiving, file_size);
        let snapshot = stats.snapshot();
        self.current = Some(InboundTransfer {
            file_name,
            file_size,
            total_chunks,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            stats,
        });

        ReceiveOutcome::Started {
            stats: snapshot,
            superseded,
        }
    }

    fn on_chunk(&mut self, index: u32, data: Bytes) -> ReceiveOutcome {
        let limit = self.config.max_file_size;
        let Some(transfer) = self.current.as_mut() else {
            debug!(event = "chunk_without_transfer", index, "Chunk with no active transfer");
            return ReceiveOutcome::Ignored;
        };

        if index >= transfer.total_chunks {
            return ReceiveOutcome::Rejected {
                error: SessionError::MalformedMessage(format!(
                    "chunk index {index} outside 0..{}",
                    transfer.total_chunks
                )),
                abandoned: None,
            };
        }

        let len = data.len() as u64;
        let replaced = transfer.chunks.insert(index, data).map_or(0, |old| old.len() as u64);
        transfer.received_bytes = transfer.received_bytes - replaced + len;

        if transfer.received_bytes > limit {
            let file_name = transfer.file_name.clone();
            let size = transfer.received_bytes;
            return ReceiveOutcome::Rejected {
                error: SessionError::FileTooLarge { file_name, size, limit },
                abandoned: self.abandon(AbandonReason::Incomplete),
            };
        }

        let received = transfer.received_bytes;
        ReceiveOutcome::Progress(transfer.stats.update(received))
    }

    fn on_complete(&mut self) -> ReceiveOutcome {
        let Some(mut transfer) = self.current.take() else {
            debug!(event = "complete_without_transfer", "Complete with no active transfer");
            return ReceiveOutcome::Ignored;
        };

        if self.config.verify_completeness && !transfer.is_complete() {
            let error = SessionError::IncompleteTransfer {
                file_name: transfer.file_name.clone(),
                received_chunks: transfer.chunks.len() as u32,
                total_chunks: transfer.total_chunks,
                received_bytes: transfer.received_bytes,
                file_size: transfer.file_size,
            };
            warn!(event = "transfer_incomplete", error = %error, "Rejecting incomplete transfer");
            return ReceiveOutcome::Rejected {
                error,
                abandoned: Some(transfer.abandoned(AbandonReason::Incomplete)),
            };
        }

        let data = transfer.assemble();
        transfer.stats.update(data.len() as u64);
        let stats = transfer.stats.finish();

        info!(
            event = "receive_complete",
            file = %transfer.file_name,
            bytes = data.len(),
            "File received"
        );

        ReceiveOutcome::Completed {
            file: ReceivedFile {
                file_name: transfer.file_name,
                data,
            },
            stats,
        }
    }
}
