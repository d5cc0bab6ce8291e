//! Payload decoding for captured response bodies.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use super::types::FetchedBody;

/// Failure to turn a captured payload into text.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("payload is not valid utf-8: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),
}

/// Decode a raw payload into text.
///
/// Transport-encoded payloads are base64-decoded before the UTF-8 check;
/// plain payloads only go through the UTF-8 check.
pub fn decode_payload(raw: impl AsRef<[u8]>, transport_encoded: bool) -> Result<String, DecodeError> {
    let bytes = if transport_encoded {
        STANDARD.decode(raw.as_ref())?
    } else {
        raw.as_ref().to_vec()
    };
    Ok(String::from_utf8(bytes)?)
}

impl FetchedBody {
    /// Decode according to the `base64Encoded` flag reported by the session.
    pub fn decode(&self) -> Result<String, DecodeError> {
        decode_payload(self.body.as_bytes(), self.base64_encoded)
    }
}
