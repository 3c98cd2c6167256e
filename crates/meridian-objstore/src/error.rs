//! Error types for the object store.

use meridian_net::NetError;
use meridian_proto::{ErrorCode, ObjRef};
use thiserror::Error;

/// Object store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Object not present in the store.
    #[error("object {0} not found")]
    ObjectNotFound(ObjRef),

    /// Object is being delivered but is not finalized yet.
    #[error("object {0} not finalized")]
    NotFinalized(ObjRef),

    /// The task that produced the object failed.
    #[error("task producing object {objref} failed: {message}")]
    TaskFailed { objref: ObjRef, message: String },

    /// A pull from a peer store failed.
    #[error("transfer of object {objref} from {src} failed: {reason}")]
    TransferFailed {
        objref: ObjRef,
        src: String,
        reason: String,
    },

    /// Chunk metadata changed mid-stream.
    #[error("inconsistent chunk metadata for object {0}")]
    ChunkMismatch(ObjRef),

    /// Upload or transfer ended before `total_size` bytes arrived.
    #[error("truncated payload for object {objref}: {received} of {expected} bytes")]
    Truncated {
        objref: ObjRef,
        received: u64,
        expected: u64,
    },

    /// Operation violates the protocol contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The scheduler could not be reached for a completion callback.
    #[error("scheduler callback failed: {0}")]
    SchedulerCallback(String),

    /// Transport error.
    #[error(transparent)]
    Net(#[from] NetError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Maps the error to its wire-level code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ObjectNotFound(_) => ErrorCode::ObjectNotFound,
            Self::NotFinalized(_) => ErrorCode::ObjectNotFinalized,
            Self::TaskFailed { .. } => ErrorCode::TaskFailure,
            Self::TransferFailed { .. } => ErrorCode::TransferFailure,
            Self::ChunkMismatch(_) | Self::Truncated { .. } | Self::ProtocolViolation(_) => {
                ErrorCode::ProtocolViolation
            }
            Self::SchedulerCallback(_) | Self::Net(_) | Self::Config(_) | Self::Io(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
