//! Task descriptors.
//!
//! A task is a function invocation scheduled on a worker. The scheduler
//! treats the descriptor as opaque except for the function name, the
//! argument list, and the result arity (derived from the function table).

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::{ObjRef, OperationId};

/// One task argument: either an inline serialised value or an object
/// reference to be resolved at the worker's local store.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Inline serialised value.
    Value(Vec<u8>),
    /// Reference to an object held by the cluster.
    Ref(ObjRef),
}

impl Arg {
    /// Returns the object reference if this argument is a reference.
    #[must_use]
    pub const fn objref(&self) -> Option<ObjRef> {
        match self {
            Self::Ref(r) => Some(*r),
            Self::Value(_) => None,
        }
    }
}

/// A task as submitted by a client or worker.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Name of the function to invoke.
    pub function: String,
    /// Ordered arguments.
    pub args: Vec<Arg>,
}

impl TaskSpec {
    /// Creates a new task spec.
    #[must_use]
    pub fn new(function: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }
}

/// A task as dispatched to a worker.
///
/// Reference arguments are rewritten to their canonical form at dispatch
/// time, so workers only ever address canonical references.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskDispatch {
    /// Scheduler-assigned operation id.
    pub operation_id: OperationId,
    /// Name of the function to invoke.
    pub function: String,
    /// Ordered arguments, references canonicalised.
    pub args: Vec<Arg>,
    /// References allocated for the task's results, in return order.
    pub result_refs: Vec<ObjRef>,
}
