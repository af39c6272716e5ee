use std::io;

use rbus_codec::error::{DecodeError, EncodeError};
use rbus_codec::types::ErrorType;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Decoding error
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),
    /// Encoding error
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    #[error("Unknown subscription operation")]
    UnknownOperation(i32),
    /// Read timeout
    #[error("Read timeout")]
    ReadTimeout,
    /// Write timeout
    #[error("Write timeout")]
    WriteTimeout,
    /// Close timeout
    #[error("Close timeout")]
    CloseTimeout,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io error, {0}")]
    Io(#[from] io::Error),
}

impl BusError {
    /// Error kind to report to the peer before closing, `None` when the
    /// connection should close silently.
    #[inline]
    pub fn error_kind(&self) -> Option<ErrorType> {
        match self {
            BusError::Decode(e) => e.error_kind(),
            BusError::UnknownOperation(_) => Some(ErrorType::UnknownOperation),
            BusError::Encode(_)
            | BusError::ReadTimeout
            | BusError::WriteTimeout
            | BusError::CloseTimeout
            | BusError::ServiceUnavailable
            | BusError::ConnectionClosed
            | BusError::Io(_) => None,
        }
    }

    /// Text for the error frame. Matches the message the peer has always received.
    #[inline]
    pub fn description(&self) -> String {
        match self {
            BusError::Decode(DecodeError::InvalidMessage(_)) => "Could not decode the message".into(),
            BusError::Decode(DecodeError::UnknownType(_)) => {
                "Unknown message type, is the server up-to-date?".into()
            }
            BusError::Decode(e) => e.to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let e = BusError::from(DecodeError::PayloadTooShort);
        assert_eq!(e.error_kind(), Some(ErrorType::PayloadTooShort));
        assert_eq!(e.description(), "Got a null payload");

        let e = BusError::from(DecodeError::UnknownType(9));
        assert_eq!(e.error_kind(), Some(ErrorType::UnknownType));
        assert_eq!(e.description(), "Unknown message type, is the server up-to-date?");

        let e = BusError::UnknownOperation(7);
        assert_eq!(e.error_kind(), Some(ErrorType::UnknownOperation));
        assert_eq!(e.description(), "Unknown subscription operation");

        let e = BusError::from(DecodeError::Io(io::Error::from(io::ErrorKind::ConnectionReset)));
        assert_eq!(e.error_kind(), None);
        assert_eq!(BusError::WriteTimeout.error_kind(), None);
    }
}
