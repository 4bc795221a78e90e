//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering wire, endpoint and transport failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Endpoint errors
    /// The configured endpoint could not be turned into a valid URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The endpoint scheme is not one of the supported values.
    #[error("unsupported scheme: {0} (expected http or https)")]
    UnsupportedScheme(String),

    // Connection errors
    /// The persistent connection could not be established.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Writing a frame to the connection failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Reading a frame from the connection failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // Request errors
    /// A one-shot request returned a non-success status.
    #[error("request failed with status {status}: {body}")]
    RequestStatus {
        /// HTTP status code returned by the host.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// A one-shot request could not be completed.
    #[error("request failed: {0}")]
    RequestFailed(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<url::ParseError> for ProtocolError {
    fn from(err: url::ParseError) -> Self {
        ProtocolError::InvalidEndpoint(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                ProtocolError::HandshakeFailed(err.to_string())
            }
            _ => ProtocolError::ReceiveFailed(err.to_string()),
        }
    }
}
