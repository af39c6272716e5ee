use std::io;

use crate::types::ErrorType;

/// Errors raised while turning bytes into packets.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Got a null payload")]
    PayloadTooShort,
    #[error("Got a payload of: {size}B (>{max}B)")]
    PayloadTooBig { size: u32, max: u32 },
    #[error("Could not decode the message, {0}")]
    InvalidMessage(#[from] prost::DecodeError),
    #[error("Unknown message type {0}, is the server up-to-date?")]
    UnknownType(i32),
    #[error("io error, {:?}", _0)]
    Io(io::Error),
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> DecodeError {
        DecodeError::Io(e)
    }
}

impl DecodeError {
    /// The protocol error kind reported to the peer, `None` for transport failures.
    #[inline]
    pub fn error_kind(&self) -> Option<ErrorType> {
        match self {
            DecodeError::PayloadTooShort => Some(ErrorType::PayloadTooShort),
            DecodeError::PayloadTooBig { .. } => Some(ErrorType::PayloadTooBig),
            DecodeError::InvalidMessage(_) => Some(ErrorType::InvalidMessage),
            DecodeError::UnknownType(_) => Some(ErrorType::UnknownType),
            DecodeError::Io(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Frame of {0}B exceeds the maximum frame size")]
    FrameTooBig(usize),
    #[error("io error, {:?}", _0)]
    Io(io::Error),
}

impl From<io::Error> for EncodeError {
    fn from(e: io::Error) -> EncodeError {
        EncodeError::Io(e)
    }
}
