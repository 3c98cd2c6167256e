//! Error types for the transport layer.

use meridian_proto::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Transport errors.
#[derive(Error, Debug)]
pub enum NetError {
    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection was refused by the remote endpoint.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Frame-level protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer sent a message the caller did not expect.
    #[error("unexpected message from peer: {0}")]
    UnexpectedMessage(String),

    /// The peer answered with a structured error.
    #[error("remote error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },
}

impl NetError {
    /// Returns the wire error code when the error is a remote rejection.
    #[must_use]
    pub const fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, NetError>;
