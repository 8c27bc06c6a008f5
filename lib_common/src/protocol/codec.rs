//! # Framing
//!
//! One JSON object per line. The line codec enforces the frame size limit; a
//! frame over the limit ends the stream, which the receiver treats as a dead
//! session.

use tokio_util::codec::LinesCodec;

use super::envelope::Envelope;
use super::error::ProtocolError;

/// Largest accepted frame, newline excluded.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Line codec configured with the frame size limit.
pub fn frame_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)
}

/// Serializes an envelope to a single line (the codec appends the newline).
pub fn encode_frame(envelope: &Envelope) -> Result<String, ProtocolError> {
    let line = serde_json::to_string(envelope)
        .map_err(|e| ProtocolError::Serialize { tag: envelope.message.clone(), reason: e.to_string() })?;
    if line.len() > MAX_FRAME_LENGTH {
        return Err(ProtocolError::FrameTooLong(MAX_FRAME_LENGTH));
    }
    Ok(line)
}

/// Parses one received line into an envelope.
pub fn decode_frame(line: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}
