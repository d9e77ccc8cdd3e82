//! Transport error types.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Errors raised while moving frames or remote calls between containers.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Could not connect to a peer.
    #[error("connection failed: {addr} - {reason}")]
    ConnectionFailed {
        /// The address that failed to connect.
        addr: String,
        /// Reason for failure.
        reason: String,
    },

    /// The link was closed while a frame or response was outstanding.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Reason for closure.
        reason: String,
    },

    /// A frame could not be queued for sending.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// A line could not be encoded or decoded.
    #[error("malformed frame: {0}")]
    Codec(String),

    /// The remote side handled the call and reported an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<LinesCodecError> for TransportError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(e) => e.into(),
            other => Self::Codec(other.to_string()),
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
