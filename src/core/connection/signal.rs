//! Signal payloads and their copy/paste token form.
//!
//! A token is the payload compressed with Brotli and encoded with URL-safe
//! Base64, behind a one-character version prefix:
//!
//!   "1" + base64url(brotli(payload))

use crate::core::error::SessionError;
use anyhow::{anyhow, Context};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use brotli::{CompressorWriter, Decompressor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

/// Version prefix of the token format.
const TOKEN_VERSION: &str = "1";

/// Refuse to inflate tokens beyond this; real session descriptions are a
/// few kilobytes.
const MAX_EXPANDED_LEN: u64 = 1024 * 1024;

/// Opaque local description produced by a peer primitive. Exchanged exactly
/// once per direction through an out-of-band channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(String);

impl SignalPayload {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compact text form for copy/paste.
    pub fn to_token(&self) -> anyhow::Result<String> {
        let mut compressed = Vec::new();
        {
            let mut compressor = CompressorWriter::new(&mut compressed, 4096, 11, 22);
            compressor.write_all(self.0.as_bytes())?;
        }
        Ok(format!("{TOKEN_VERSION}{}", URL_SAFE_NO_PAD.encode(&compressed)))
    }

    /// Parse a token produced by [`to_token`](Self::to_token). Surrounding
    /// whitespace is ignored.
    pub fn from_token(token: &str) -> Result<Self, SessionError> {
        expand(token.trim())
            .map(Self)
            .map_err(|e| SessionError::SignalRejected(format!("{e:#}")))
    }
}

impl fmt::Display for SignalPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn expand(token: &str) -> anyhow::Result<String> {
    let body = token
        .strip_prefix(TOKEN_VERSION)
        .ok_or_else(|| anyhow!("unsupported token version"))?;
    let compressed = URL_SAFE_NO_PAD
        .decode(body)
        .context("failed to decode base64")?;

    let mut expanded = String::new();
    Decompressor::new(compressed.as_slice(), 4096)
        .take(MAX_EXPANDED_LEN)
        .read_to_string(&mut expanded)
        .context("failed to decompress token")?;
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let sdp = r#"{"type":"offer","sdp":"v=0\r\no=- 4215 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n"}"#;
        let payload = SignalPayload::new(sdp);
        let token = payload.to_token().unwrap();

        assert!(token.starts_with('1'));
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(SignalPayload::from_token(&format!("  {token}\n")).unwrap(), payload);
    }

    #[test]
    fn test_bad_tokens_are_rejected() {
        for token in ["", "2abc", "1!!!", "1%%%%"] {
            assert!(matches!(
                SignalPayload::from_token(token),
                Err(SessionError::SignalRejected(_))
            ));
        }
    }

    #[test]
    fn test_payload_serializes_as_plain_string() {
        let payload = SignalPayload::new("x");
        assert_eq!(serde_json::to_string(&payload).unwrap(), r#""x""#);
    }
}
