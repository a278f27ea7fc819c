//! Base64 transport encoding for payloads crossing the caller boundary.
//!
//! Inside the dispatch layer payloads are raw bytes; callers exchange them as
//! standard-alphabet base64 without line wrapping.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::DispatchError;

/// Decode a caller-supplied payload. An empty string is an empty payload.
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, DispatchError> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(encoded)
        .map_err(|e| DispatchError::Decode(e.to_string()))
}

/// Encode a payload for the caller. An empty payload is an empty string.
pub fn encode_payload(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    STANDARD.encode(bytes)
}
