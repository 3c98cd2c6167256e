//! The worker's task loop.
//!
//! Lifecycle: register with the scheduler, announce functions, then loop —
//! report readiness (with the previous task's outcome), await a dispatch,
//! pull reference arguments through the local store, execute, publish the
//! results. A task that fails still publishes its result refs, as failed
//! records carrying the captured error message.

use bytes::Bytes;
use meridian_net::{framing, NetError, ObjStoreClient, SchedulerClient};
use meridian_proto::{
    decode_payload, Arg, Codec, Envelope, MessageType, TaskDispatch, TaskOutcome, WorkerId,
    WorkerMessage, WorkerRequest, WorkerResponse,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Result, TaskError, WorkerError};
use crate::functions::{FunctionRegistry, ReturnValue, TaskContext};

/// A worker process: one task at a time, pulled through the local store.
pub struct WorkerRuntime {
    config: WorkerConfig,
    registry: FunctionRegistry,
}

impl WorkerRuntime {
    /// Creates a runtime over a populated function registry.
    #[must_use]
    pub fn new(config: WorkerConfig, registry: FunctionRegistry) -> Self {
        Self { config, registry }
    }

    /// Registers with the scheduler and runs the task loop until
    /// cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let advertised = match &self.config.advertise_addr {
            Some(addr) => addr.clone(),
            None => listener.local_addr()?.to_string(),
        };

        let scheduler = SchedulerClient::new(&self.config.scheduler_addr);
        let (worker_id, objstore_id) = scheduler
            .register_worker(&advertised, &self.config.objstore_addr)
            .await?;
        info!(%worker_id, %objstore_id, addr = %advertised, "worker registered");

        for (name, arity) in self.registry.entries() {
            scheduler.register_function(worker_id, &name, arity).await?;
        }

        let (tx, mut rx) = mpsc::channel::<TaskDispatch>(1);
        tokio::spawn(serve_dispatch(listener, tx, cancel.clone()));

        let objstore = ObjStoreClient::new(&self.config.objstore_addr);
        let mut outcome: Option<TaskOutcome> = None;
        loop {
            scheduler.ready_for_new_task(worker_id, outcome.take()).await?;

            let dispatch = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                dispatch = rx.recv() => dispatch.ok_or(WorkerError::DispatchClosed)?,
            };

            outcome = Some(
                self.execute(&scheduler, &objstore, worker_id, dispatch)
                    .await,
            );
        }
    }

    /// Executes one dispatch, capturing any failure into the outcome.
    async fn execute(
        &self,
        scheduler: &SchedulerClient,
        objstore: &ObjStoreClient,
        worker_id: WorkerId,
        dispatch: TaskDispatch,
    ) -> TaskOutcome {
        let operation_id = dispatch.operation_id;
        let result_refs = dispatch.result_refs.clone();
        debug!(%operation_id, function = %dispatch.function, "executing task");

        let ctx = TaskContext::new(scheduler.clone(), objstore.clone(), worker_id);
        let result = self.try_execute(objstore, scheduler, &ctx, dispatch).await;

        // Holds on refs the task allocated are released either way; refs
        // handed out via aliasing or containment have gained their own.
        let allocated = ctx.take_allocated();
        if !allocated.is_empty() {
            if let Err(e) = scheduler.decrement_ref_count(allocated).await {
                warn!(%operation_id, error = %e, "failed to release task-allocated refs");
            }
        }

        match result {
            Ok(()) => TaskOutcome::success(operation_id),
            Err(e) => {
                let message = e.to_string();
                warn!(%operation_id, error = %message, "task failed");
                // Publish the failure so readers of the result refs fail
                // with the captured message instead of blocking.
                for objref in &result_refs {
                    if let Err(e) = objstore.put_failed(*objref, &message).await {
                        warn!(%objref, error = %e, "failed to record failed result");
                    }
                }
                TaskOutcome::failure(operation_id, message)
            }
        }
    }

    async fn try_execute(
        &self,
        objstore: &ObjStoreClient,
        scheduler: &SchedulerClient,
        ctx: &TaskContext,
        dispatch: TaskDispatch,
    ) -> std::result::Result<(), TaskError> {
        let registered = self
            .registry
            .get(&dispatch.function)
            .ok_or_else(|| {
                TaskError::msg(format!(
                    "function {} is not registered on this worker",
                    dispatch.function
                ))
            })?
            .clone();

        // Arguments are local by the time a task is dispatched; reference
        // fetches only touch the co-located store.
        let mut args = Vec::with_capacity(dispatch.args.len());
        for arg in &dispatch.args {
            match arg {
                Arg::Value(value) => args.push(Bytes::from(value.clone())),
                Arg::Ref(objref) => {
                    let (data, _) = objstore.get_obj(*objref).await?;
                    args.push(data);
                }
            }
        }

        // Run on a separate task so a panic is captured, not fatal.
        let function = registered.function.clone();
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { function.invoke(&task_ctx, args).await });
        let outputs = match handle.await {
            Ok(result) => result?,
            Err(join_error) => return Err(TaskError::msg(panic_message(join_error))),
        };

        if outputs.len() != dispatch.result_refs.len() {
            return Err(TaskError::msg(format!(
                "function {} returned {} values, registered arity is {}",
                dispatch.function,
                outputs.len(),
                dispatch.result_refs.len()
            )));
        }

        for (output, result_ref) in outputs.into_iter().zip(&dispatch.result_refs) {
            match output {
                ReturnValue::Payload {
                    data,
                    metadata_offset,
                    contained,
                } => {
                    objstore.put_obj(*result_ref, metadata_offset, &data).await?;
                    if !contained.is_empty() {
                        scheduler
                            .add_contained_objrefs(*result_ref, contained)
                            .await?;
                    }
                }
                ReturnValue::ObjRef(inner) => {
                    // The result is declared equal to an existing ref.
                    scheduler.alias_objrefs(*result_ref, inner).await?;
                }
            }
        }
        Ok(())
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if join_error.is_panic() {
        let panic = join_error.into_panic();
        if let Some(s) = panic.downcast_ref::<&str>() {
            format!("task panicked: {s}")
        } else if let Some(s) = panic.downcast_ref::<String>() {
            format!("task panicked: {s}")
        } else {
            "task panicked".to_owned()
        }
    } else {
        "task cancelled".to_owned()
    }
}

/// Accepts `ExecuteTask` pushes from the scheduler.
async fn serve_dispatch(
    listener: TcpListener,
    tx: mpsc::Sender<TaskDispatch>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { return };
                debug!(%peer, "dispatch connection accepted");
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_dispatch_connection(stream, tx).await {
                        warn!(%peer, error = %e, "dispatch connection error");
                    }
                });
            }
        }
    }
}

async fn handle_dispatch_connection(
    mut stream: TcpStream,
    tx: mpsc::Sender<TaskDispatch>,
) -> std::result::Result<(), NetError> {
    let mut codec = Codec::with_capacity(8192);
    loop {
        let Some((header, payload)) = framing::read_frame(&mut stream).await? else {
            return Ok(());
        };
        if header.message_type != MessageType::Worker {
            warn!("received non-worker message type: {:?}", header.message_type);
            continue;
        }

        let envelope: Envelope<WorkerMessage> = decode_payload(&payload)?;
        let WorkerMessage::Request(WorkerRequest::Execute(dispatch)) = envelope.payload else {
            warn!("received response instead of request");
            continue;
        };

        let response = if tx.send(dispatch).await.is_ok() {
            WorkerResponse::Ack
        } else {
            WorkerResponse::error(
                meridian_proto::ErrorCode::InternalError,
                "worker is shutting down",
            )
        };

        let reply = Envelope::response_to(&envelope.header, WorkerMessage::Response(response));
        let frame = codec.frame(MessageType::Worker, &reply)?.to_vec();
        framing::write_frame(&mut stream, &frame).await?;
    }
}
