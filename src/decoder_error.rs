//! Decoder errors.

/// Errors thrown by the decoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecoderError {
    /// The packet is malformed: truncated, bad frame count or illegal framing.
    ///
    /// The decoder state stays consistent; the caller should treat the packet
    /// as lost and may run concealment for its nominal duration.
    InvalidPacket,
    /// The output buffer cannot hold the decoded samples.
    BufferTooSmall,
    /// An internal decoder error. Indicates a broken invariant, not bad input.
    InternalError(&'static str),
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecoderError::InvalidPacket => {
                write!(f, "invalid packet")
            }
            DecoderError::BufferTooSmall => {
                write!(f, "output buffer is too small")
            }
            DecoderError::InternalError(message) => {
                write!(f, "{}", message)
            }
        }
    }
}

impl std::error::Error for DecoderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
