//! Error types for the scheduler.

use meridian_proto::{ErrorCode, ObjRef, ObjStoreId, WorkerId};
use thiserror::Error;

/// Scheduler errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Worker not found.
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// Object store not found.
    #[error("unknown object store: {0}")]
    UnknownObjStore(ObjStoreId),

    /// No object store registered at the given address.
    #[error("no object store registered at {0}")]
    UnknownObjStoreAddress(String),

    /// Conflicting arities for one function name.
    #[error("arity mismatch for function {function}: registered {registered}, offered {offered}")]
    ArityMismatch {
        function: String,
        registered: u32,
        offered: u32,
    },

    /// Reference that was never allocated.
    #[error("unknown object reference: {0}")]
    UnknownObjRef(ObjRef),

    /// Reference whose refcount reached zero and was deallocated.
    #[error("retired object reference: {0}")]
    RetiredObjRef(ObjRef),

    /// Alias edge that would close a cycle.
    #[error("aliasing {alias} to {target} would create a cycle")]
    AliasCycle { alias: ObjRef, target: ObjRef },

    /// Alias redeclared with a different target.
    #[error("{alias} already aliases {existing}, cannot re-alias to {target}")]
    AliasConflict {
        alias: ObjRef,
        existing: ObjRef,
        target: ObjRef,
    },

    /// Operation violates the protocol contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// Maps the error to its wire-level code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownWorker(_) => ErrorCode::UnknownWorker,
            Self::UnknownObjStore(_) | Self::UnknownObjStoreAddress(_) => ErrorCode::UnknownObjStore,
            Self::ArityMismatch { .. } => ErrorCode::ArityMismatch,
            Self::UnknownObjRef(_) => ErrorCode::ObjectNotFound,
            Self::RetiredObjRef(_) => ErrorCode::RetiredObjRef,
            Self::AliasCycle { .. } => ErrorCode::AliasCycle,
            Self::AliasConflict { .. } | Self::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            Self::Config(_) | Self::Io(_) => ErrorCode::InternalError,
        }
    }
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
