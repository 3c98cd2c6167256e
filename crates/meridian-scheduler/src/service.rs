//! The scheduler's wire service.
//!
//! Each connection is handled by a loop that reads a frame, dispatches the
//! request against the shared [`SchedulerState`] under its single lock,
//! writes the response, and then executes the collected side-effect
//! actions outside the lock. Peer RPC completions and failures re-enter
//! the state as fresh events.

use std::sync::Arc;

use meridian_net::{framing, NetError, ObjStoreClient, WorkerClient};
use meridian_proto::{
    decode_payload, Codec, Envelope, MessageType, SchedulerMessage, SchedulerRequest,
    SchedulerResponse,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use crate::state::{Action, SchedulerState};

/// The scheduler service.
pub struct SchedulerService {
    state: Arc<Mutex<SchedulerState>>,
}

impl SchedulerService {
    /// Creates a service around fresh state.
    #[must_use]
    pub fn new(state: SchedulerState) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Shared handle to the state, used by the introspection API.
    #[must_use]
    pub fn state(&self) -> Arc<Mutex<SchedulerState>> {
        self.state.clone()
    }

    /// Accepts connections until cancelled.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "scheduler connection accepted");
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_connection(stream).await {
                            warn!(%peer, error = %e, "scheduler connection error");
                        }
                    });
                }
            }
        }
    }

    /// Handles one connection, processing requests until it closes.
    pub async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<(), NetError> {
        let mut codec = Codec::with_capacity(8192);
        loop {
            let Some((header, payload)) = framing::read_frame(&mut stream).await? else {
                return Ok(());
            };
            if header.message_type != MessageType::Scheduler {
                warn!("received non-scheduler message type: {:?}", header.message_type);
                continue;
            }

            let envelope: Envelope<SchedulerMessage> = decode_payload(&payload)?;
            let request = match envelope.payload {
                SchedulerMessage::Request(request) => request,
                SchedulerMessage::Response(_) => {
                    warn!("received response instead of request");
                    continue;
                }
            };

            let (response, actions) = self.handle_request(request).await;

            let reply = Envelope::response_to(
                &envelope.header,
                SchedulerMessage::Response(response),
            );
            let frame = codec.frame(MessageType::Scheduler, &reply)?.to_vec();
            framing::write_frame(&mut stream, &frame).await?;

            self.clone().spawn_actions(actions);
        }
    }

    /// Dispatches one request under the state lock.
    async fn handle_request(&self, request: SchedulerRequest) -> (SchedulerResponse, Vec<Action>) {
        let mut state = self.state.lock().await;
        let result = match request {
            SchedulerRequest::RegisterWorker {
                worker_addr,
                objstore_addr,
            } => state
                .register_worker(worker_addr, &objstore_addr)
                .map(|(worker_id, objstore_id)| {
                    (
                        SchedulerResponse::WorkerRegistered {
                            worker_id,
                            objstore_id,
                        },
                        Vec::new(),
                    )
                }),
            SchedulerRequest::RegisterObjStore { addr } => {
                let objstore_id = state.register_objstore(addr);
                Ok((SchedulerResponse::ObjStoreRegistered { objstore_id }, Vec::new()))
            }
            SchedulerRequest::RegisterFunction {
                worker_id,
                function,
                arity,
            } => state
                .register_function(worker_id, &function, arity)
                .map(|actions| (SchedulerResponse::Ack, actions)),
            SchedulerRequest::SubmitTask(spec) => {
                state
                    .submit_task(spec)
                    .map(|(result_refs, function_registered, actions)| {
                        (
                            SchedulerResponse::Submitted {
                                result_refs,
                                function_registered,
                            },
                            actions,
                        )
                    })
            }
            SchedulerRequest::PushObj { worker_id } => state
                .push_obj(worker_id)
                .map(|objref| (SchedulerResponse::ObjRefAssigned { objref }, Vec::new())),
            SchedulerRequest::RequestObj { worker_id, objref } => state
                .request_obj(worker_id, objref)
                .map(|actions| (SchedulerResponse::Ack, actions)),
            SchedulerRequest::AliasObjRefs { alias, target } => state
                .alias_objrefs(alias, target)
                .map(|actions| (SchedulerResponse::Ack, actions)),
            SchedulerRequest::ObjReady { objref, objstore_id } => state
                .obj_ready(objref, objstore_id)
                .map(|actions| (SchedulerResponse::Ack, actions)),
            SchedulerRequest::IncrementCount { objref } => state
                .increment_refs(&[objref])
                .map(|()| (SchedulerResponse::Ack, Vec::new())),
            SchedulerRequest::DecrementCount { objref } => state
                .decrement_refs(&[objref])
                .map(|actions| (SchedulerResponse::Ack, actions)),
            SchedulerRequest::IncrementRefCount { objrefs } => state
                .increment_refs(&objrefs)
                .map(|()| (SchedulerResponse::Ack, Vec::new())),
            SchedulerRequest::DecrementRefCount { objrefs } => state
                .decrement_refs(&objrefs)
                .map(|actions| (SchedulerResponse::Ack, actions)),
            SchedulerRequest::AddContainedObjRefs { objref, contained } => state
                .add_contained(objref, contained)
                .map(|()| (SchedulerResponse::Ack, Vec::new())),
            SchedulerRequest::ReadyForNewTask { worker_id, outcome } => state
                .ready_for_new_task(worker_id, outcome)
                .map(|actions| (SchedulerResponse::Ack, actions)),
            SchedulerRequest::SchedulerInfo => {
                Ok((SchedulerResponse::Info(state.snapshot()), Vec::new()))
            }
            SchedulerRequest::TaskInfo => {
                Ok((SchedulerResponse::Tasks(state.task_snapshots()), Vec::new()))
            }
        };

        match result {
            Ok((response, actions)) => (response, actions),
            Err(e) => {
                warn!(error = %e, "scheduler request rejected");
                (SchedulerResponse::error(e.code(), e.to_string()), Vec::new())
            }
        }
    }

    /// Executes side-effect actions as background peer RPCs.
    fn spawn_actions(self: Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            let service = self.clone();
            tokio::spawn(async move {
                service.run_action(action).await;
            });
        }
    }

    async fn run_action(self: Arc<Self>, action: Action) {
        match action {
            Action::StartDelivery {
                store,
                store_addr,
                src_addr,
                objref,
            } => {
                let client = ObjStoreClient::new(store_addr);
                if let Err(e) = client.start_delivery(src_addr, objref).await {
                    warn!(%objref, dst = %store, error = %e, "delivery failed");
                    let follow_up = {
                        let mut state = self.state.lock().await;
                        state.delivery_failed(store, objref)
                    };
                    match follow_up {
                        Ok(actions) => self.spawn_actions(actions),
                        Err(e) => error!(error = %e, "delivery failure handling failed"),
                    }
                }
            }
            Action::NotifyAlias {
                store_addr,
                alias,
                canonical,
            } => {
                let client = ObjStoreClient::new(&store_addr);
                if let Err(e) = client.notify_alias(alias, canonical).await {
                    warn!(%alias, %canonical, store = %store_addr, error = %e, "alias notification failed");
                }
            }
            Action::Deallocate { store_addr, objref } => {
                // Fire and forget; stores treat deallocation idempotently.
                let client = ObjStoreClient::new(&store_addr);
                if let Err(e) = client.deallocate_object(objref).await {
                    warn!(%objref, store = %store_addr, error = %e, "deallocation notification failed");
                }
            }
            Action::Execute {
                worker,
                worker_addr,
                dispatch,
            } => {
                let operation_id = dispatch.operation_id;
                let client = WorkerClient::new(&worker_addr);
                if let Err(e) = client.execute(dispatch).await {
                    error!(%operation_id, %worker, error = %e, "task dispatch failed");
                    let follow_up = {
                        let mut state = self.state.lock().await;
                        state.dispatch_failed(operation_id, &format!("dispatch to worker failed: {e}"))
                    };
                    match follow_up {
                        Ok(actions) => self.spawn_actions(actions),
                        Err(e) => error!(error = %e, "dispatch failure handling failed"),
                    }
                }
            }
        }
    }
}
