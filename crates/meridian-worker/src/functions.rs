//! The worker's function registry and task context.
//!
//! Functions are native implementations looked up by name. The scheduler
//! never interprets them; it only tracks `name → (eligible workers,
//! arity)`. Each invocation receives its decoded arguments plus a
//! [`TaskContext`] that can read cluster objects, publish new ones, and
//! submit nested tasks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use meridian_net::{ObjStoreClient, SchedulerClient};
use meridian_proto::{Arg, ObjRef, TaskSpec, WorkerId};

use crate::error::TaskError;

/// One value returned by a task function.
#[derive(Debug, Clone)]
pub enum ReturnValue {
    /// A payload to store under the task's result ref.
    Payload {
        data: Vec<u8>,
        /// Boundary between serialised-object prefix and buffer suffix.
        metadata_offset: u64,
        /// Refs embedded inside the payload, reported to the scheduler's
        /// garbage collector on the container's behalf.
        contained: Vec<ObjRef>,
    },
    /// An existing ref the result aliases (e.g. the output of a nested
    /// task submission).
    ObjRef(ObjRef),
}

impl ReturnValue {
    /// A plain payload with no embedded refs.
    #[must_use]
    pub const fn payload(data: Vec<u8>, metadata_offset: u64) -> Self {
        Self::Payload {
            data,
            metadata_offset,
            contained: Vec::new(),
        }
    }

    /// A payload embedding other refs.
    #[must_use]
    pub const fn container(data: Vec<u8>, metadata_offset: u64, contained: Vec<ObjRef>) -> Self {
        Self::Payload {
            data,
            metadata_offset,
            contained,
        }
    }
}

/// A task function executable by this worker.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    /// Runs the function over decoded arguments.
    async fn invoke(&self, ctx: &TaskContext, args: Vec<Bytes>) -> Result<Vec<ReturnValue>, TaskError>;
}

/// Adapter for synchronous closures.
struct SyncFn<F>(F);

#[async_trait]
impl<F> TaskFunction for SyncFn<F>
where
    F: Fn(&TaskContext, Vec<Bytes>) -> Result<Vec<ReturnValue>, TaskError> + Send + Sync,
{
    async fn invoke(&self, ctx: &TaskContext, args: Vec<Bytes>) -> Result<Vec<ReturnValue>, TaskError> {
        (self.0)(ctx, args)
    }
}

/// One registered function.
#[derive(Clone)]
pub struct RegisteredFunction {
    /// Number of values the function returns.
    pub arity: u32,
    /// The implementation.
    pub function: Arc<dyn TaskFunction>,
}

/// Name → function table for one worker.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function implementation.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        arity: u32,
        function: Arc<dyn TaskFunction>,
    ) {
        self.functions
            .insert(name.into(), RegisteredFunction { arity, function });
    }

    /// Registers a synchronous closure.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, arity: u32, f: F)
    where
        F: Fn(&TaskContext, Vec<Bytes>) -> Result<Vec<ReturnValue>, TaskError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, arity, Arc::new(SyncFn(f)));
    }

    /// Looks up a function by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisteredFunction> {
        self.functions.get(name)
    }

    /// Name and arity of every registered function.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, u32)> {
        self.functions
            .iter()
            .map(|(name, f)| (name.clone(), f.arity))
            .collect()
    }

    /// Returns true when no functions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Cluster access handed to a running task.
#[derive(Clone)]
pub struct TaskContext {
    scheduler: SchedulerClient,
    objstore: ObjStoreClient,
    worker_id: WorkerId,
    /// Refs this task allocated; the worker's holds on them are released
    /// when the task finishes.
    allocated: Arc<Mutex<Vec<ObjRef>>>,
}

impl TaskContext {
    /// Creates a context bound to this worker's scheduler and local store.
    #[must_use]
    pub fn new(scheduler: SchedulerClient, objstore: ObjStoreClient, worker_id: WorkerId) -> Self {
        Self {
            scheduler,
            objstore,
            worker_id,
            allocated: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// This worker's id.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn track(&self, refs: &[ObjRef]) {
        if let Ok(mut allocated) = self.allocated.lock() {
            allocated.extend_from_slice(refs);
        }
    }

    /// Refs allocated during the task, drained for hold release.
    #[must_use]
    pub fn take_allocated(&self) -> Vec<ObjRef> {
        self.allocated
            .lock()
            .map(|mut allocated| std::mem::take(&mut *allocated))
            .unwrap_or_default()
    }

    /// Submits a nested task, returning its result refs.
    pub async fn submit(&self, function: &str, args: Vec<Arg>) -> Result<Vec<ObjRef>, TaskError> {
        let (refs, registered) = self
            .scheduler
            .submit_task(TaskSpec::new(function, args))
            .await?;
        if !registered {
            return Err(TaskError::msg(format!(
                "nested submit failed: function {function} is not registered"
            )));
        }
        self.track(&refs);
        Ok(refs)
    }

    /// Reads an object, pulling it to the local store first if needed.
    pub async fn get(&self, objref: ObjRef) -> Result<(Bytes, u64), TaskError> {
        self.scheduler.request_obj(self.worker_id, objref).await?;
        Ok(self.objstore.get_obj(objref).await?)
    }

    /// Publishes a standalone object and returns its fresh ref.
    pub async fn put(&self, data: &[u8], metadata_offset: u64) -> Result<ObjRef, TaskError> {
        let objref = self.scheduler.push_obj(self.worker_id).await?;
        self.objstore.put_obj(objref, metadata_offset, data).await?;
        self.track(&[objref]);
        Ok(objref)
    }
}
