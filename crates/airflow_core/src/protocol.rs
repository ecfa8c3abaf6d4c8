//! Wire formats on both sides of the sender.
//!
//! Device side (serial, ASCII):
//!
//! ```text
//! request:  <address>\r
//! reply:    <echo> <pressure> <temperature> <vol-flow> <mass-flow> <set-point> <gas>\r
//! ```
//!
//! Bus side: one JSON object per sample, fields in this order:
//!
//! ```text
//! {"pressure":…,"temperature":…,"volumetic-flow":…,"mass-flow":…,
//!  "set-point":…,"gas":"…","site":"…","at":"<RFC3339>"}
//! ```

use crate::types::Sample;

/// Byte that ends every controller reply (carriage return).
pub const TERMINATOR: u8 = b'\r';

/// Number of back-to-back queries sent to wake a sleeping controller.
pub const WAKE_REPEATS: usize = 5;

/// Tokens a complete reply carries: echo + five numbers + gas.
pub const REPLY_TOKENS: usize = 7;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize sample: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize sample: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Builds the query frame `<address>\r` for a controller.
pub fn query_frame(address: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(address.len() + 1);
    frame.extend_from_slice(address.as_bytes());
    frame.push(TERMINATOR);
    frame
}

/// Encodes a [`Sample`] as the compact JSON message published on the bus.
pub fn encode_sample(sample: &Sample) -> Result<String, ProtocolError> {
    serde_json::to_string(sample).map_err(ProtocolError::Serialize)
}

/// Decodes a bus message back into a [`Sample`].
pub fn decode_sample(message: &str) -> Result<Sample, ProtocolError> {
    serde_json::from_str(message).map_err(ProtocolError::Deserialize)
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
