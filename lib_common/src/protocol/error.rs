use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// # Protocol Error
///
/// Everything that can go wrong between a raw frame on the wire and a typed
/// message. None of these are fatal on their own; the receiver counts them and
/// drops the session once too many arrive in a row.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame exceeds the maximum length of {0} bytes")]
    FrameTooLong(usize),

    #[error("Unexpected message tag '{0}'")]
    UnexpectedTag(String),

    #[error("Response '{0}' does not match any outstanding request")]
    UnsolicitedResponse(String),

    #[error("Invalid payload for '{tag}': {reason}")]
    InvalidPayload { tag: String, reason: String },

    #[error("Failed to serialize '{tag}': {reason}")]
    Serialize { tag: String, reason: String },

    #[error("Frame codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinesCodecError> for ProtocolError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLong(super::codec::MAX_FRAME_LENGTH),
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}
