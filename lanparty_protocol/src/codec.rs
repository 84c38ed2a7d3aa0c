// Envelope encoding.
//
// An envelope is encoded as a single compact JSON object. `serde_json` never
// emits a raw newline in compact mode (newlines inside strings are escaped),
// so the same bytes work as one line on the reliable stream and as one whole
// datagram on the unreliable socket.
//
// `decode` is total: anything that is not a well-formed envelope with a known
// tag comes back as a `DecodeError`, and callers drop the record and keep
// their loop running.

use thiserror::Error;

use crate::message::Envelope;

/// Upper bound on an encoded envelope. Comfortably below the UDP payload
/// limit; envelopes are small structured records.
pub const MAX_RECORD_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty record")]
    Empty,
    #[error("record too large: {len} bytes (max {MAX_RECORD_SIZE})")]
    TooLarge { len: usize },
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("encoded envelope too large: {len} bytes (max {MAX_RECORD_SIZE})")]
    TooLarge { len: usize },
    /// JSON has no NaN or infinity; `serde_json` would write `null`, which
    /// no receiver can decode.
    #[error("{tag} has a non-finite coordinate")]
    NonFinite { tag: &'static str },
}

/// Encode an envelope as one newline-free JSON record.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    if !envelope.message.is_finite() {
        return Err(EncodeError::NonFinite {
            tag: envelope.message.tag(),
        });
    }
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_RECORD_SIZE {
        return Err(EncodeError::TooLarge { len: bytes.len() });
    }
    Ok(bytes)
}

/// Decode one record. Surrounding whitespace (including a trailing `\r\n`
/// left over from line framing) is ignored.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.len() > MAX_RECORD_SIZE {
        return Err(DecodeError::TooLarge { len: bytes.len() });
    }
    let trimmed = bytes.trim_ascii();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(trimmed)?)
}
