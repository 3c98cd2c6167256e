//! Scheduler protocol messages.
//!
//! These messages carry the scheduler's full operation surface:
//!
//! - **Client/Worker → Scheduler**: registration, task submission, object
//!   reference lifecycle, reference counting, task completion
//! - **Scheduler → caller**: typed responses and introspection snapshots

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::task::TaskSpec;
use crate::types::{ObjRef, ObjStoreId, OperationId, WorkerId};

/// Scheduler message types.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerMessage {
    /// Request to the scheduler.
    Request(SchedulerRequest),
    /// Response from the scheduler.
    Response(SchedulerResponse),
}

/// Requests accepted by the scheduler service.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerRequest {
    /// Registers a worker. The worker's co-located object store must
    /// already be registered under `objstore_addr`.
    RegisterWorker {
        /// Address the worker serves `ExecuteTask` on.
        worker_addr: String,
        /// Address of the worker's co-located object store.
        objstore_addr: String,
    },
    /// Registers an object store.
    RegisterObjStore {
        /// Address the store serves its RPCs on.
        addr: String,
    },
    /// Adds a worker to a function's eligible set.
    RegisterFunction {
        worker_id: WorkerId,
        function: String,
        /// Number of values the function returns.
        arity: u32,
    },
    /// Submits a task for execution.
    SubmitTask(TaskSpec),
    /// Reserves a fresh object reference for an imminent upload.
    PushObj { worker_id: WorkerId },
    /// Asks the scheduler to make an object local to the worker's store.
    RequestObj { worker_id: WorkerId, objref: ObjRef },
    /// Declares `alias` equal to `target`.
    AliasObjRefs { alias: ObjRef, target: ObjRef },
    /// Reports that a store holds the finalized payload for `objref`.
    ObjReady { objref: ObjRef, objstore_id: ObjStoreId },
    /// Adjusts a single submitter-held reference count upward.
    IncrementCount { objref: ObjRef },
    /// Adjusts a single submitter-held reference count downward.
    DecrementCount { objref: ObjRef },
    /// Batch reference count increment; duplicates act per occurrence.
    IncrementRefCount { objrefs: Vec<ObjRef> },
    /// Batch reference count decrement; duplicates act per occurrence.
    DecrementRefCount { objrefs: Vec<ObjRef> },
    /// Records references embedded inside a produced payload.
    AddContainedObjRefs {
        objref: ObjRef,
        contained: Vec<ObjRef>,
    },
    /// Reports the previous task's outcome and asks for new work.
    ReadyForNewTask {
        worker_id: WorkerId,
        /// Outcome of the previous task, absent on the first call.
        outcome: Option<TaskOutcome>,
    },
    /// Read-only snapshot of scheduler state.
    SchedulerInfo,
    /// Read-only snapshot of all task records.
    TaskInfo,
}

/// Outcome of a finished task, reported via `ReadyForNewTask`.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// The finished operation.
    pub operation_id: OperationId,
    /// Whether the task ran to completion.
    pub succeeded: bool,
    /// Captured error message when the task failed.
    pub error_message: Option<String>,
}

impl TaskOutcome {
    /// Creates a successful outcome.
    #[must_use]
    pub const fn success(operation_id: OperationId) -> Self {
        Self {
            operation_id,
            succeeded: true,
            error_message: None,
        }
    }

    /// Creates a failed outcome with a captured error message.
    #[must_use]
    pub fn failure(operation_id: OperationId, message: impl Into<String>) -> Self {
        Self {
            operation_id,
            succeeded: false,
            error_message: Some(message.into()),
        }
    }
}

/// Responses produced by the scheduler service.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerResponse {
    /// Worker registered.
    WorkerRegistered {
        worker_id: WorkerId,
        objstore_id: ObjStoreId,
    },
    /// Object store registered.
    ObjStoreRegistered { objstore_id: ObjStoreId },
    /// Task submitted (or rejected without enqueueing when the function is
    /// unknown, in which case `result_refs` is empty).
    Submitted {
        result_refs: Vec<ObjRef>,
        function_registered: bool,
    },
    /// A fresh reference reserved by `PushObj`.
    ObjRefAssigned { objref: ObjRef },
    /// Generic acknowledgement.
    Ack,
    /// Scheduler state snapshot.
    Info(SchedulerSnapshot),
    /// Task records snapshot.
    Tasks(Vec<TaskSnapshot>),
    /// The request failed.
    Error { code: ErrorCode, message: String },
}

impl SchedulerResponse {
    /// Creates an error response.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Worker state for protocol messages.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStateProto {
    /// Registered, not yet asked for work.
    Registering,
    /// Waiting for a task.
    Idle,
    /// Executing a task.
    Busy,
}

/// Task status for protocol messages.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatusProto {
    /// Waiting in the queue (possibly matched, awaiting transfers).
    Queued,
    /// Dispatched to a worker.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Raised during execution or failed in transfer.
    Failed,
}

/// Snapshot of one worker record.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub address: String,
    pub objstore_id: ObjStoreId,
    pub state: WorkerStateProto,
    pub current_task: Option<OperationId>,
}

/// Snapshot of one function table entry.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionSnapshot {
    pub name: String,
    pub arity: u32,
    pub workers: Vec<WorkerId>,
}

/// Snapshot of one object reference record.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjectSnapshot {
    pub objref: ObjRef,
    /// Terminal node of the alias chain.
    pub canonical: ObjRef,
    /// Reference count (meaningful on canonical refs).
    pub refcount: u64,
    pub ready: bool,
    pub retired: bool,
    /// Stores currently holding the payload.
    pub locations: Vec<ObjStoreId>,
}

/// Snapshot of one task record.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub operation_id: OperationId,
    pub function: String,
    pub status: TaskStatusProto,
    pub assigned_worker: Option<WorkerId>,
    pub result_refs: Vec<ObjRef>,
    pub error_message: Option<String>,
}

/// Full scheduler state snapshot.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub workers: Vec<WorkerSnapshot>,
    /// Registered object stores as `(id, address)` pairs.
    pub objstores: Vec<(ObjStoreId, String)>,
    pub functions: Vec<FunctionSnapshot>,
    /// Queued operations, oldest first.
    pub queued: Vec<OperationId>,
    pub objects: Vec<ObjectSnapshot>,
}
