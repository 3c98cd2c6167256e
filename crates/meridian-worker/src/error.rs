//! Error types for the worker.

use meridian_net::NetError;
use thiserror::Error;

/// Worker process errors. Task-level failures are not errors here; they
/// are captured and reported through `ReadyForNewTask`.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Transport error talking to the scheduler or local store.
    #[error(transparent)]
    Net(#[from] NetError),

    /// The dispatch channel closed unexpectedly.
    #[error("dispatch channel closed")]
    DispatchClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// A failure inside a task function.
///
/// Captured and reported to the scheduler with the task outcome; readers
/// of the task's result refs observe the message.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    /// Creates a task error from any displayable value.
    #[must_use]
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

impl From<NetError> for TaskError {
    fn from(e: NetError) -> Self {
        Self::msg(e)
    }
}
