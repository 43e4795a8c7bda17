//! Error taxonomy of the session layer.
//!
//! Connection-level errors (`SessionTimeout`, `SignalRejected`, `PeerError`)
//! move the session to `failed`. Protocol-level errors (`MalformedMessage`,
//! `IncompleteTransfer`, `FileTooLarge`) are reported and the offending
//! message is dropped; the connection is left alone.
//!
//! Errors are `Clone` because they travel on the broadcast event bus.

use crate::core::session::ConnectionState;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no signal payload produced within {secs}s")]
    SessionTimeout { secs: u64 },

    #[error("remote signal rejected: {0}")]
    SignalRejected(String),

    #[error("no connected peer")]
    NotConnected,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("peer connection error: {0}")]
    PeerError(String),

    #[error("transfer of '{file_name}' incomplete: {received_chunks}/{total_chunks} chunks, {received_bytes}/{file_size} bytes")]
    IncompleteTransfer {
        file_name: String,
        received_chunks: u32,
        total_chunks: u32,
        received_bytes: u64,
        file_size: u64,
    },

    #[error("'{file_name}' is {size} bytes, above the {limit} byte limit")]
    FileTooLarge {
        file_name: String,
        size: u64,
        limit: u64,
    },

    #[error("{operation} not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("a file is already being sent")]
    TransferInProgress,

    #[error("transfer cancelled")]
    TransferCancelled,

    #[error("'{file_name}' ({file_size} bytes) needs more than u32::MAX chunks of {chunk_size} bytes")]
    TooManyChunks {
        file_name: String,
        file_size: u64,
        chunk_size: usize,
    },

    #[error("failed to read file source: {0}")]
    SourceRead(String),
}

impl SessionError {
    /// Whether this error tears down the current peer connection.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::SessionTimeout { .. } | Self::SignalRejected(_) | Self::PeerError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_errors() {
        assert!(SessionError::SessionTimeout { secs: 30 }.is_connection_level());
        assert!(SessionError::SignalRejected("bad sdp".into()).is_connection_level());
        assert!(SessionError::PeerError("ice failed".into()).is_connection_level());
        assert!(!SessionError::MalformedMessage("eof".into()).is_connection_level());
        assert!(!SessionError::NotConnected.is_connection_level());
    }

    #[test]
    fn invalid_state_names_the_operation() {
        let err = SessionError::InvalidState {
            operation: "accept_signal",
            state: ConnectionState::Disconnected,
        };
        assert_eq!(err.to_string(), "accept_signal not allowed while disconnected");
    }
}
