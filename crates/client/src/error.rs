//! Error types for the client session layer.

use protocol::ProtocolError;
use thiserror::Error;

use crate::multiplexer::SessionState;

/// Errors surfaced by the connection multiplexer and its helpers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// `connect()` was called on a multiplexer that already left `Idle`.
    #[error("session already started (state: {0})")]
    AlreadyStarted(SessionState),

    /// The session has terminated; no more commands are accepted.
    #[error("session terminated")]
    SessionTerminated,

    /// Shutdown was requested before the connection was established.
    #[error("connect cancelled by shutdown")]
    Cancelled,

    /// Wire or transport failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Reading input or writing output on the console failed.
    #[error("console I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
