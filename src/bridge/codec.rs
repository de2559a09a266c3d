//! Transport encoding for terminal bytes
//!
//! Frames carry standard, padded base64 so arbitrary (non-UTF-8) terminal
//! output survives text WebSocket messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// An inbound frame that is not valid base64
#[derive(Debug, Error)]
#[error("Malformed frame: {0}")]
pub struct DecodeError(#[from] base64::DecodeError);

/// Encode raw terminal bytes as a frame payload
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a frame payload into raw bytes
pub fn decode(payload: impl AsRef<[u8]>) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(payload)?)
}
