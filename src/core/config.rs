//! Centralized configuration for peerbeam.
//!
//! Tunable defaults live here as constants so they can be reviewed in a
//! single place. [`SessionConfig`] gathers them into a serde struct that can
//! be loaded from TOML and overridden from the command line. Wire-format
//! constants (frame type bytes) stay in the protocol module.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KiB).
///
/// Small enough that a base64-encoded JSON chunk stays well under the 64 KB
/// SCTP message limit most WebRTC stacks default to.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for the data channel send buffer (bytes).
/// When `buffered_amount` plus the next frame exceeds this value the sender
/// pauses until the buffer drains.
pub const BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Polling interval while waiting for the send buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on a single backpressure wait; past it the sender proceeds.
pub const BACKPRESSURE_MAX_WAIT: Duration = Duration::from_secs(10);

/// Largest file the receiver is willing to reassemble in memory (2 GiB).
pub const MAX_RECEIVE_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

// ── Connection / Signaling ───────────────────────────────────────────────────

/// How long the initiator waits for its local signal payload.
pub const INITIATOR_SIGNAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for ICE candidate gathering (non-trickle signaling).
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

/// Capacity of the session event bus; slower subscribers lag past this.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Label of the single data channel opened by the initiator.
pub const DATA_CHANNEL_LABEL: &str = "peerbeam";

/// Public STUN servers used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ── Config structs ───────────────────────────────────────────────────────────

/// Encoding used for outbound chunk messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Every message is a JSON text frame, chunk data base64-encoded.
    #[default]
    Json,
    /// Metadata/complete stay JSON, chunks travel as raw binary frames.
    Binary,
}

/// One ICE server entry (STUN or TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Tunables of the chunked transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Outbound chunk size in bytes.
    pub chunk_size: usize,
    pub wire_format: WireFormat,
    /// Fixed delay inserted after every chunk, in milliseconds (0 = off).
    pub chunk_pacing_ms: u64,
    /// Send-buffer high water mark in bytes.
    pub buffered_amount_high: usize,
    pub backpressure_poll_ms: u64,
    pub backpressure_max_wait_ms: u64,
    /// Reject a `Complete` whose chunk set has gaps.
    pub verify_completeness: bool,
    /// Largest inbound file accepted, in bytes.
    pub max_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            wire_format: WireFormat::Json,
            chunk_pacing_ms: 0,
            buffered_amount_high: BUFFERED_AMOUNT_HIGH,
            backpressure_poll_ms: BACKPRESSURE_POLL_INTERVAL.as_millis() as u64,
            backpressure_max_wait_ms: BACKPRESSURE_MAX_WAIT.as_millis() as u64,
            verify_completeness: true,
            max_file_size: MAX_RECEIVE_FILE_SIZE,
        }
    }
}

impl TransferConfig {
    pub fn chunk_pacing(&self) -> Option<Duration> {
        (self.chunk_pacing_ms > 0).then(|| Duration::from_millis(self.chunk_pacing_ms))
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms.max(1))
    }

    pub fn backpressure_max_wait(&self) -> Duration {
        Duration::from_millis(self.backpressure_max_wait_ms)
    }
}

/// Configuration of one [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds the initiator waits for its signal payload (`None` = forever).
    pub initiator_signal_timeout_secs: Option<u64>,
    /// Seconds the responder waits for its signal payload (`None` = forever).
    pub responder_signal_timeout_secs: Option<u64>,
    pub event_capacity: usize,
    pub ice_servers: Vec<IceServerConfig>,
    pub transfer: TransferConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initiator_signal_timeout_secs: Some(INITIATOR_SIGNAL_TIMEOUT.as_secs()),
            responder_signal_timeout_secs: None,
            event_capacity: EVENT_BUS_CAPACITY,
            ice_servers: vec![IceServerConfig {
                urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                username: String::new(),
                credential: String::new(),
            }],
            transfer: TransferConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load a config from a TOML file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn initiator_signal_timeout(&self) -> Option<Duration> {
        self.initiator_signal_timeout_secs.map(Duration::from_secs)
    }

    pub fn responder_signal_timeout(&self) -> Option<Duration> {
        self.responder_signal_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timeouts() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.initiator_signal_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.responder_signal_timeout(), None);
        assert_eq!(cfg.transfer.chunk_size, 16 * 1024);
        assert_eq!(cfg.transfer.chunk_pacing(), None);
        assert!(cfg.transfer.verify_completeness);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: SessionConfig = toml::from_str(
            r#"
            responder_signal_timeout_secs = 45

            [transfer]
            chunk_size = 4096
            wire_format = "binary"
            chunk_pacing_ms = 1
            "#,
        )
        .unwrap();

        assert_eq!(cfg.responder_signal_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(cfg.initiator_signal_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.transfer.chunk_size, 4096);
        assert_eq!(cfg.transfer.wire_format, WireFormat::Binary);
        assert_eq!(cfg.transfer.chunk_pacing(), Some(Duration::from_millis(1)));
        assert_eq!(cfg.transfer.buffered_amount_high, BUFFERED_AMOUNT_HIGH);
        assert_eq!(cfg.ice_servers.len(), 1);
    }
}
