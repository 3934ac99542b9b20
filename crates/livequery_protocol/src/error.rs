//! Error types for the protocol crate.

use livequery_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, encoding or decoding protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid CBOR for the value model.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The `type` tag names no known message.
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),

    /// A required field is absent.
    #[error("{context}: missing field {field:?}")]
    MissingField {
        /// Message or structure being decoded.
        context: String,
        /// Name of the missing field.
        field: String,
    },

    /// A field is present but has the wrong shape.
    #[error("{context}: field {field:?} must be {expected}")]
    InvalidField {
        /// Message or structure being decoded.
        context: String,
        /// Name of the offending field.
        field: String,
        /// Description of the expected shape.
        expected: String,
    },

    /// A caller-supplied value cannot be expressed on the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ProtocolError {
    /// Create a missing field error.
    pub fn missing_field(context: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            context: context.into(),
            field: field.into(),
        }
    }

    /// Create an invalid field error.
    pub fn invalid_field(
        context: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidField {
            context: context.into(),
            field: field.into(),
            expected: expected.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::missing_field("transition", "position");
        assert_eq!(err.to_string(), "transition: missing field \"position\"");

        let err = ProtocolError::invalid_field("mutation", "request_id", "a non-negative integer");
        assert!(err.to_string().contains("request_id"));
    }

    #[test]
    fn codec_errors_convert() {
        let err: ProtocolError = CodecError::NaNForbidden.into();
        assert!(matches!(err, ProtocolError::Codec(CodecError::NaNForbidden)));
    }
}
