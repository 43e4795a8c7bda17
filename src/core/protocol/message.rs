//! Wire encoding of transfer messages.
//!
//! Default form is one JSON object per text frame:
//!
//!   {"type":"file-metadata","fileName":..,"fileSize":..,"totalChunks":..}
//!   {"type":"file-chunk","chunkIndex":..,"data":"<base64>"}
//!   {"type":"file-complete"}
//!
//! Chunks may instead travel as binary frames, which skips the base64
//! inflation:
//!
//!   [0x02][4 bytes chunk index BE][payload]
//!
//! [`TransferMessage::decode`] accepts both forms regardless of the local
//! wire format.

use crate::core::config::WireFormat;
use crate::core::error::SessionError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Leading byte of a binary chunk frame.
pub const FRAME_CHUNK: u8 = 0x02;

const CHUNK_HEADER_LEN: usize = 1 + 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferMessage {
    #[serde(rename = "file-metadata", rename_all = "camelCase")]
    Metadata {
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    #[serde(rename = "file-chunk")]
    Chunk {
        #[serde(rename = "chunkIndex")]
        index: u32,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    #[serde(rename = "file-complete")]
    Complete,
}

/// One encoded message, ready for the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransferMessage {
    pub fn encode(&self, format: WireFormat) -> Result<WireFrame, SessionError> {
        match (self, format) {
            (Self::Chunk { index, data }, WireFormat::Binary) => {
                let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + data.len());
                buf.put_u8(FRAME_CHUNK);
                buf.put_u32(*index);
                buf.extend_from_slice(data);
                Ok(WireFrame::Binary(buf.freeze()))
            }
            _ => serde_json::to_string(self)
                .map(WireFrame::Text)
                .map_err(|e| SessionError::MalformedMessage(e.to_string())),
        }
    }

    /// Decode a raw frame. JSON text and binary chunk frames are both accepted.
    pub fn decode(raw: &Bytes) -> Result<Self, SessionError> {
        match raw.first() {
            Some(&FRAME_CHUNK) => {
                if raw.len() < CHUNK_HEADER_LEN {
                    return Err(SessionError::MalformedMessage(format!(
                        "chunk frame too short: {} bytes",
                        raw.len()
                    )));
                }
                let index = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
                Ok(Self::Chunk {
                    index,
                    data: raw.slice(CHUNK_HEADER_LEN..),
                })
            }
            Some(_) => serde_json::from_slice(raw)
                .map_err(|e| SessionError::MalformedMessage(e.to_string())),
            None => Err(SessionError::MalformedMessage("empty frame".into())),
        }
    }
}

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
