//! Error types for the protocol.

use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Invalid message payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Message too large.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Deserialisation error.
    #[error("deserialisation error: {0}")]
    Deserialisation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire-level error codes.
///
/// These are included in error responses to allow structured error handling.
/// Codes are grouped by category:
/// - 1-19: Protocol errors
/// - 20-39: Scheduling errors
/// - 40-59: Object errors
/// - 60-69: Internal errors
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    // Protocol errors (1-19)
    /// Unsupported protocol version.
    UnsupportedVersion = 1,
    /// Invalid message payload.
    InvalidPayload = 2,
    /// Message exceeds size limit.
    MessageTooLarge = 3,
    /// Operation violates the protocol contract.
    ProtocolViolation = 4,

    // Scheduling errors (20-39)
    /// Function no worker has registered.
    UnknownFunction = 20,
    /// Conflicting arities for one function name.
    ArityMismatch = 21,
    /// Worker not found in registry.
    UnknownWorker = 22,
    /// Object store not found in registry.
    UnknownObjStore = 23,

    // Object errors (40-59)
    /// Reference whose refcount reached zero and was deallocated.
    RetiredObjRef = 40,
    /// Alias edge that would close a cycle.
    AliasCycle = 41,
    /// Object not present in the store.
    ObjectNotFound = 42,
    /// Object present but not yet finalized.
    ObjectNotFinalized = 43,
    /// The task that produced this object failed.
    TaskFailure = 44,
    /// All candidate source stores exhausted for a delivery.
    TransferFailure = 45,

    // Internal errors (60-69)
    /// Internal server error.
    InternalError = 60,
}

impl ErrorCode {
    /// Returns the numeric value of this error code.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates an error code from a numeric value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::InvalidPayload),
            3 => Some(Self::MessageTooLarge),
            4 => Some(Self::ProtocolViolation),
            20 => Some(Self::UnknownFunction),
            21 => Some(Self::ArityMismatch),
            22 => Some(Self::UnknownWorker),
            23 => Some(Self::UnknownObjStore),
            40 => Some(Self::RetiredObjRef),
            41 => Some(Self::AliasCycle),
            42 => Some(Self::ObjectNotFound),
            43 => Some(Self::ObjectNotFinalized),
            44 => Some(Self::TaskFailure),
            45 => Some(Self::TransferFailure),
            60 => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Checks if this is a protocol error (1-19).
    #[must_use]
    pub const fn is_protocol_error(self) -> bool {
        matches!(self.as_u8(), 1..=19)
    }

    /// Checks if this is a scheduling error (20-39).
    #[must_use]
    pub const fn is_scheduling_error(self) -> bool {
        matches!(self.as_u8(), 20..=39)
    }

    /// Checks if this is an object error (40-59).
    #[must_use]
    pub const fn is_object_error(self) -> bool {
        matches!(self.as_u8(), 40..=59)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedVersion => write!(f, "unsupported_version"),
            Self::InvalidPayload => write!(f, "invalid_payload"),
            Self::MessageTooLarge => write!(f, "message_too_large"),
            Self::ProtocolViolation => write!(f, "protocol_violation"),
            Self::UnknownFunction => write!(f, "unknown_function"),
            Self::ArityMismatch => write!(f, "arity_mismatch"),
            Self::UnknownWorker => write!(f, "unknown_worker"),
            Self::UnknownObjStore => write!(f, "unknown_objstore"),
            Self::RetiredObjRef => write!(f, "retired_objref"),
            Self::AliasCycle => write!(f, "alias_cycle"),
            Self::ObjectNotFound => write!(f, "object_not_found"),
            Self::ObjectNotFinalized => write!(f, "object_not_finalized"),
            Self::TaskFailure => write!(f, "task_failure"),
            Self::TransferFailure => write!(f, "transfer_failure"),
            Self::InternalError => write!(f, "internal_error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_roundtrip() {
        let codes = [
            ErrorCode::UnsupportedVersion,
            ErrorCode::InvalidPayload,
            ErrorCode::MessageTooLarge,
            ErrorCode::ProtocolViolation,
            ErrorCode::UnknownFunction,
            ErrorCode::ArityMismatch,
            ErrorCode::UnknownWorker,
            ErrorCode::UnknownObjStore,
            ErrorCode::RetiredObjRef,
            ErrorCode::AliasCycle,
            ErrorCode::ObjectNotFound,
            ErrorCode::ObjectNotFinalized,
            ErrorCode::TaskFailure,
            ErrorCode::TransferFailure,
            ErrorCode::InternalError,
        ];

        for code in codes {
            let value = code.as_u8();
            let restored = ErrorCode::from_u8(value);
            assert_eq!(restored, Some(code));
        }
    }

    #[test]
    fn error_code_categories() {
        assert!(ErrorCode::ProtocolViolation.is_protocol_error());
        assert!(ErrorCode::UnknownFunction.is_scheduling_error());
        assert!(ErrorCode::RetiredObjRef.is_object_error());

        assert!(!ErrorCode::RetiredObjRef.is_scheduling_error());
    }

    #[test]
    fn error_code_display() {
        assert_eq!(ErrorCode::AliasCycle.to_string(), "alias_cycle");
        assert_eq!(ErrorCode::TransferFailure.to_string(), "transfer_failure");
    }
}
