//! Worker protocol messages.
//!
//! The worker service has a single operation: the scheduler pushes a task
//! dispatch, the worker acknowledges receipt and reports the outcome later
//! via the scheduler's `ReadyForNewTask`.

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::task::TaskDispatch;

/// Worker message types.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Request to the worker.
    Request(WorkerRequest),
    /// Response from the worker.
    Response(WorkerResponse),
}

/// Requests accepted by the worker service.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    /// Dispatches a task for execution.
    Execute(TaskDispatch),
}

/// Responses produced by the worker service.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WorkerResponse {
    /// Dispatch accepted.
    Ack,
    /// Dispatch rejected.
    Error { code: ErrorCode, message: String },
}

impl WorkerResponse {
    /// Creates an error response.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}
