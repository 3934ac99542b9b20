//! Error types for the sync client.

use livequery_codec::{CodecError, Value};
use livequery_protocol::{ProtocolError, ServerFailure};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether reconnecting can help.
        retryable: bool,
    },

    /// The server sent something the client cannot accept.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// A value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The server rejected the authentication token.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A server function reported an application error.
    #[error("server error: {message}")]
    Server {
        /// Error message.
        message: String,
        /// Optional structured error data.
        data: Option<Value>,
    },

    /// The connection dropped while the request was in flight. Whether
    /// the server executed it is unknown.
    #[error("connection lost before the request was confirmed")]
    ConnectionLost,

    /// Caller input cannot be used.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine was closed.
    #[error("client closed")]
    EngineClosed,

    /// The runtime task driving the engine is gone.
    #[error("client runtime stopped")]
    EngineStopped,
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns true if this error can go away by reconnecting.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::ConnectionLost | ClientError::Protocol(_) => true,
            _ => false,
        }
    }

    /// Returns true if the request may or may not have executed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ClientError::ConnectionLost)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidArgument(message) => ClientError::InvalidArgument(message),
            ProtocolError::Codec(CodecError::NaNForbidden) => {
                ClientError::InvalidArgument("NaN cannot be sent to the server".into())
            }
            other => ClientError::Protocol(other),
        }
    }
}

impl From<ServerFailure> for ClientError {
    fn from(failure: ServerFailure) -> Self {
        ClientError::Server {
            message: failure.message,
            data: failure.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ClientError::transport_retryable("connection reset").is_retryable());
        assert!(!ClientError::transport_fatal("bad url").is_retryable());
        assert!(ClientError::ConnectionLost.is_retryable());
        assert!(!ClientError::EngineClosed.is_retryable());
        assert!(!ClientError::Server {
            message: "nope".into(),
            data: None
        }
        .is_retryable());
    }

    #[test]
    fn connection_lost_is_distinguishable() {
        assert!(ClientError::ConnectionLost.is_connection_lost());
        assert!(!ClientError::EngineClosed.is_connection_lost());
    }

    #[test]
    fn protocol_errors_map_to_caller_errors() {
        let err: ClientError = ProtocolError::InvalidArgument("empty path".into()).into();
        assert_eq!(err, ClientError::InvalidArgument("empty path".into()));

        let err: ClientError = ProtocolError::Codec(CodecError::NaNForbidden).into();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err: ClientError = ProtocolError::UnknownMessageType("x".into()).into();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn server_failure_converts() {
        let err: ClientError = ServerFailure::new("denied").with_data(Value::from(1)).into();
        assert_eq!(
            err,
            ClientError::Server {
                message: "denied".into(),
                data: Some(Value::from(1)),
            }
        );
        assert_eq!(err.to_string(), "server error: denied");
    }
}
