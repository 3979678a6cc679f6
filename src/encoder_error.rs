//! Encoder errors.

/// Errors thrown by the encoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncoderError {
    /// Bad arguments: unsupported rate, channel count or frame size.
    BadArguments(&'static str),
    /// The output buffer is too small for the requested bitrate envelope.
    BufferTooSmall,
    /// The forward range coder stream and the backward raw-bit stream
    /// collided; the frame does not fit the byte budget.
    BudgetExceeded,
    /// An internal encoder error. Indicates a broken invariant, not bad input.
    InternalError(&'static str),
}

impl std::fmt::Display for EncoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderError::BadArguments(message) => {
                write!(f, "{}", message)
            }
            EncoderError::BufferTooSmall => {
                write!(f, "output buffer is too small")
            }
            EncoderError::BudgetExceeded => {
                write!(f, "bit budget of the frame exceeded")
            }
            EncoderError::InternalError(message) => {
                write!(f, "{}", message)
            }
        }
    }
}

impl std::error::Error for EncoderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
