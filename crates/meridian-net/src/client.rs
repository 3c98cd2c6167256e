//! Typed RPC clients for the three Meridian services.
//!
//! Clients open one connection per request, mirroring the request/response
//! discipline of the wire protocol. Streamed transfers hold their
//! connection open for the duration of the chunk run.

use bytes::{Bytes, BytesMut};
use meridian_proto::{
    decode_payload, Codec, Envelope, MessageType, ObjChunk, ObjRef, ObjSnapshot, ObjStoreId, ObjStoreMessage,
    ObjStoreRequest, ObjStoreResponse, SchedulerMessage, SchedulerRequest, SchedulerResponse,
    SchedulerSnapshot, TaskDispatch, TaskOutcome, TaskSnapshot, TaskSpec, WorkerId, WorkerMessage,
    WorkerRequest, WorkerResponse, MAX_CHUNK_DATA,
};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{NetError, Result};
use crate::framing;

/// Client for the scheduler service.
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    addr: String,
}

impl SchedulerClient {
    /// Creates a client for the scheduler at `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Returns the scheduler address this client talks to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn request(&self, request: SchedulerRequest) -> Result<SchedulerResponse> {
        let mut stream = framing::connect(&self.addr).await?;

        let mut codec = Codec::new();
        let envelope = Envelope::new(SchedulerMessage::Request(request));
        let frame = codec.frame(MessageType::Scheduler, &envelope)?.to_vec();
        framing::write_frame(&mut stream, &frame).await?;

        let payload = framing::read_frame_expecting(&mut stream, MessageType::Scheduler).await?;
        let envelope: Envelope<SchedulerMessage> = decode_payload(&payload)?;

        match envelope.payload {
            SchedulerMessage::Response(SchedulerResponse::Error { code, message }) => {
                Err(NetError::Remote { code, message })
            }
            SchedulerMessage::Response(response) => Ok(response),
            SchedulerMessage::Request(_) => Err(NetError::UnexpectedMessage(
                "scheduler sent a request instead of a response".to_owned(),
            )),
        }
    }

    /// Registers a worker and its co-located object store address.
    pub async fn register_worker(
        &self,
        worker_addr: impl Into<String>,
        objstore_addr: impl Into<String>,
    ) -> Result<(WorkerId, ObjStoreId)> {
        match self
            .request(SchedulerRequest::RegisterWorker {
                worker_addr: worker_addr.into(),
                objstore_addr: objstore_addr.into(),
            })
            .await?
        {
            SchedulerResponse::WorkerRegistered {
                worker_id,
                objstore_id,
            } => Ok((worker_id, objstore_id)),
            other => Err(unexpected("RegisterWorker", &other)),
        }
    }

    /// Registers an object store.
    pub async fn register_objstore(&self, addr: impl Into<String>) -> Result<ObjStoreId> {
        match self
            .request(SchedulerRequest::RegisterObjStore { addr: addr.into() })
            .await?
        {
            SchedulerResponse::ObjStoreRegistered { objstore_id } => Ok(objstore_id),
            other => Err(unexpected("RegisterObjStore", &other)),
        }
    }

    /// Adds a worker to a function's eligible set.
    pub async fn register_function(
        &self,
        worker_id: WorkerId,
        function: impl Into<String>,
        arity: u32,
    ) -> Result<()> {
        match self
            .request(SchedulerRequest::RegisterFunction {
                worker_id,
                function: function.into(),
                arity,
            })
            .await?
        {
            SchedulerResponse::Ack => Ok(()),
            other => Err(unexpected("RegisterFunction", &other)),
        }
    }

    /// Submits a task. Returns the allocated result refs and whether the
    /// function was registered (an unknown function is not enqueued).
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<(Vec<ObjRef>, bool)> {
        match self.request(SchedulerRequest::SubmitTask(spec)).await? {
            SchedulerResponse::Submitted {
                result_refs,
                function_registered,
            } => Ok((result_refs, function_registered)),
            other => Err(unexpected("SubmitTask", &other)),
        }
    }

    /// Reserves a fresh object reference for an imminent upload.
    pub async fn push_obj(&self, worker_id: WorkerId) -> Result<ObjRef> {
        match self.request(SchedulerRequest::PushObj { worker_id }).await? {
            SchedulerResponse::ObjRefAssigned { objref } => Ok(objref),
            other => Err(unexpected("PushObj", &other)),
        }
    }

    /// Asks the scheduler to make `objref` local to the worker's store.
    pub async fn request_obj(&self, worker_id: WorkerId, objref: ObjRef) -> Result<()> {
        self.ack(SchedulerRequest::RequestObj { worker_id, objref })
            .await
    }

    /// Declares `alias` equal to `target`.
    pub async fn alias_objrefs(&self, alias: ObjRef, target: ObjRef) -> Result<()> {
        self.ack(SchedulerRequest::AliasObjRefs { alias, target })
            .await
    }

    /// Reports that a store holds the finalized payload for `objref`.
    pub async fn obj_ready(&self, objref: ObjRef, objstore_id: ObjStoreId) -> Result<()> {
        self.ack(SchedulerRequest::ObjReady {
            objref,
            objstore_id,
        })
        .await
    }

    /// Increments a single submitter-held reference count.
    pub async fn increment_count(&self, objref: ObjRef) -> Result<()> {
        self.ack(SchedulerRequest::IncrementCount { objref }).await
    }

    /// Decrements a single submitter-held reference count.
    pub async fn decrement_count(&self, objref: ObjRef) -> Result<()> {
        self.ack(SchedulerRequest::DecrementCount { objref }).await
    }

    /// Batch reference count increment.
    pub async fn increment_ref_count(&self, objrefs: Vec<ObjRef>) -> Result<()> {
        self.ack(SchedulerRequest::IncrementRefCount { objrefs })
            .await
    }

    /// Batch reference count decrement.
    pub async fn decrement_ref_count(&self, objrefs: Vec<ObjRef>) -> Result<()> {
        self.ack(SchedulerRequest::DecrementRefCount { objrefs })
            .await
    }

    /// Records references embedded inside a produced payload.
    pub async fn add_contained_objrefs(
        &self,
        objref: ObjRef,
        contained: Vec<ObjRef>,
    ) -> Result<()> {
        self.ack(SchedulerRequest::AddContainedObjRefs { objref, contained })
            .await
    }

    /// Reports the previous task's outcome and marks the worker idle.
    pub async fn ready_for_new_task(
        &self,
        worker_id: WorkerId,
        outcome: Option<TaskOutcome>,
    ) -> Result<()> {
        self.ack(SchedulerRequest::ReadyForNewTask { worker_id, outcome })
            .await
    }

    /// Fetches a read-only snapshot of scheduler state.
    pub async fn scheduler_info(&self) -> Result<SchedulerSnapshot> {
        match self.request(SchedulerRequest::SchedulerInfo).await? {
            SchedulerResponse::Info(snapshot) => Ok(snapshot),
            other => Err(unexpected("SchedulerInfo", &other)),
        }
    }

    /// Fetches a read-only snapshot of all task records.
    pub async fn task_info(&self) -> Result<Vec<TaskSnapshot>> {
        match self.request(SchedulerRequest::TaskInfo).await? {
            SchedulerResponse::Tasks(tasks) => Ok(tasks),
            other => Err(unexpected("TaskInfo", &other)),
        }
    }

    async fn ack(&self, request: SchedulerRequest) -> Result<()> {
        match self.request(request).await? {
            SchedulerResponse::Ack => Ok(()),
            other => Err(unexpected("scheduler request", &other)),
        }
    }
}

fn unexpected(op: &str, response: &SchedulerResponse) -> NetError {
    NetError::UnexpectedMessage(format!("{op}: unexpected response {response:?}"))
}

/// Client for an object store service.
#[derive(Debug, Clone)]
pub struct ObjStoreClient {
    addr: String,
}

impl ObjStoreClient {
    /// Creates a client for the object store at `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Returns the store address this client talks to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn open(&self, request: ObjStoreRequest) -> Result<TcpStream> {
        let mut stream = framing::connect(&self.addr).await?;

        let mut codec = Codec::new();
        let envelope = Envelope::new(ObjStoreMessage::Request(request));
        let frame = codec.frame(MessageType::ObjStore, &envelope)?.to_vec();
        framing::write_frame(&mut stream, &frame).await?;

        Ok(stream)
    }

    async fn read_response(stream: &mut TcpStream) -> Result<ObjStoreResponse> {
        let payload = framing::read_frame_expecting(stream, MessageType::ObjStore).await?;
        let envelope: Envelope<ObjStoreMessage> = decode_payload(&payload)?;

        match envelope.payload {
            ObjStoreMessage::Response(ObjStoreResponse::Error { code, message }) => {
                Err(NetError::Remote { code, message })
            }
            ObjStoreMessage::Response(response) => Ok(response),
            ObjStoreMessage::Request(_) => Err(NetError::UnexpectedMessage(
                "object store sent a request instead of a response".to_owned(),
            )),
        }
    }

    async fn request(&self, request: ObjStoreRequest) -> Result<ObjStoreResponse> {
        let mut stream = self.open(request).await?;
        Self::read_response(&mut stream).await
    }

    /// Instructs the store to pull `objref` from `src_addr`.
    ///
    /// Resolves once the transfer has finalized (the store reports
    /// `ObjReady` to the scheduler before answering) or failed.
    pub async fn start_delivery(&self, src_addr: impl Into<String>, objref: ObjRef) -> Result<()> {
        match self
            .request(ObjStoreRequest::StartDelivery {
                src_addr: src_addr.into(),
                objref,
            })
            .await?
        {
            ObjStoreResponse::Ack => Ok(()),
            other => Err(unexpected_store("StartDelivery", &other)),
        }
    }

    /// Installs a local alias on the store.
    pub async fn notify_alias(&self, alias: ObjRef, canonical: ObjRef) -> Result<()> {
        match self
            .request(ObjStoreRequest::NotifyAlias { alias, canonical })
            .await?
        {
            ObjStoreResponse::Ack => Ok(()),
            other => Err(unexpected_store("NotifyAlias", &other)),
        }
    }

    /// Frees the payload for `canonical`.
    pub async fn deallocate_object(&self, canonical: ObjRef) -> Result<()> {
        match self
            .request(ObjStoreRequest::DeallocateObject { canonical })
            .await?
        {
            ObjStoreResponse::Ack => Ok(()),
            other => Err(unexpected_store("DeallocateObject", &other)),
        }
    }

    /// Fetches a diagnostic snapshot. An empty list requests all objects.
    pub async fn objstore_info(&self, objrefs: Vec<ObjRef>) -> Result<Vec<ObjSnapshot>> {
        match self
            .request(ObjStoreRequest::ObjStoreInfo { objrefs })
            .await?
        {
            ObjStoreResponse::Info(info) => Ok(info),
            other => Err(unexpected_store("ObjStoreInfo", &other)),
        }
    }

    /// Opens an outbound stream of the finalized payload for `objref`.
    pub async fn stream_obj_to(&self, objref: ObjRef) -> Result<ObjStream> {
        let stream = self.open(ObjStoreRequest::StreamObjTo { objref }).await?;
        ObjStream::start(stream).await
    }

    /// Reads an object through the store, blocking until it is resolvable.
    ///
    /// Returns the assembled payload and its metadata offset.
    pub async fn get_obj(&self, objref: ObjRef) -> Result<(Bytes, u64)> {
        let stream = self.open(ObjStoreRequest::GetObj { objref }).await?;
        ObjStream::start(stream).await?.collect().await
    }

    /// Uploads a payload under `objref`, chunking as needed.
    pub async fn put_obj(&self, objref: ObjRef, metadata_offset: u64, data: &[u8]) -> Result<()> {
        let mut stream = self.open(ObjStoreRequest::PutObj { objref }).await?;

        let total_size = data.len() as u64;
        let mut codec = Codec::new();
        let mut offset = 0usize;
        loop {
            let end = usize::min(offset + MAX_CHUNK_DATA, data.len());
            let chunk = ObjChunk {
                total_size,
                metadata_offset,
                data: data[offset..end].to_vec(),
            };
            let envelope = Envelope::new(ObjStoreMessage::Request(ObjStoreRequest::Chunk(chunk)));
            let frame = codec.frame(MessageType::ObjStore, &envelope)?.to_vec();
            framing::write_frame(&mut stream, &frame).await?;

            offset = end;
            if offset >= data.len() {
                break;
            }
        }
        debug!(%objref, total_size, "uploaded object");

        match Self::read_response(&mut stream).await? {
            ObjStoreResponse::Ack => Ok(()),
            other => Err(unexpected_store("PutObj", &other)),
        }
    }

    /// Records a failed result under `objref`.
    pub async fn put_failed(&self, objref: ObjRef, error_message: impl Into<String>) -> Result<()> {
        match self
            .request(ObjStoreRequest::PutFailed {
                objref,
                error_message: error_message.into(),
            })
            .await?
        {
            ObjStoreResponse::Ack => Ok(()),
            other => Err(unexpected_store("PutFailed", &other)),
        }
    }
}

fn unexpected_store(op: &str, response: &ObjStoreResponse) -> NetError {
    NetError::UnexpectedMessage(format!("{op}: unexpected response {response:?}"))
}

/// An open inbound object stream.
///
/// The first chunk is authoritative for `total_size` and
/// `metadata_offset`; later chunks are validated against it. The stream is
/// exhausted when `total_size` bytes have been received. Every stream
/// carries at least one chunk, so zero-length objects still deliver their
/// metadata.
#[derive(Debug)]
pub struct ObjStream {
    stream: TcpStream,
    total_size: u64,
    metadata_offset: u64,
    received: u64,
    first: Option<ObjChunk>,
}

impl ObjStream {
    async fn start(mut stream: TcpStream) -> Result<Self> {
        let first = match ObjStoreClient::read_response(&mut stream).await? {
            ObjStoreResponse::Chunk(chunk) => chunk,
            other => return Err(unexpected_store("stream open", &other)),
        };

        Ok(Self {
            total_size: first.total_size,
            metadata_offset: first.metadata_offset,
            received: 0,
            first: Some(first),
            stream,
        })
    }

    /// Total payload size in bytes.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Boundary between serialised-object prefix and binary-buffer suffix.
    #[must_use]
    pub const fn metadata_offset(&self) -> u64 {
        self.metadata_offset
    }

    /// Reads the next chunk, or `None` once the payload is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<ObjChunk>> {
        if let Some(first) = self.first.take() {
            self.received += first.data.len() as u64;
            return Ok(Some(first));
        }

        if self.received >= self.total_size {
            return Ok(None);
        }

        let chunk = match ObjStoreClient::read_response(&mut self.stream).await? {
            ObjStoreResponse::Chunk(chunk) => chunk,
            other => return Err(unexpected_store("stream chunk", &other)),
        };

        if chunk.total_size != self.total_size || chunk.metadata_offset != self.metadata_offset {
            return Err(NetError::UnexpectedMessage(
                "chunk metadata changed mid-stream".to_owned(),
            ));
        }

        self.received += chunk.data.len() as u64;
        if self.received > self.total_size {
            return Err(NetError::UnexpectedMessage(format!(
                "stream overran declared size: {} > {}",
                self.received, self.total_size
            )));
        }

        Ok(Some(chunk))
    }

    /// Drains the stream into a single buffer.
    pub async fn collect(mut self) -> Result<(Bytes, u64)> {
        let mut buf = BytesMut::with_capacity(self.total_size as usize);
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk.data);
        }
        Ok((buf.freeze(), self.metadata_offset))
    }
}

/// Client for a worker service.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    addr: String,
}

impl WorkerClient {
    /// Creates a client for the worker at `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Dispatches a task to the worker.
    pub async fn execute(&self, dispatch: TaskDispatch) -> Result<()> {
        let mut stream = framing::connect(&self.addr).await?;

        let mut codec = Codec::new();
        let envelope = Envelope::new(WorkerMessage::Request(WorkerRequest::Execute(dispatch)));
        let frame = codec.frame(MessageType::Worker, &envelope)?.to_vec();
        framing::write_frame(&mut stream, &frame).await?;

        let payload = framing::read_frame_expecting(&mut stream, MessageType::Worker).await?;
        let envelope: Envelope<WorkerMessage> = decode_payload(&payload)?;

        match envelope.payload {
            WorkerMessage::Response(WorkerResponse::Ack) => Ok(()),
            WorkerMessage::Response(WorkerResponse::Error { code, message }) => {
                Err(NetError::Remote { code, message })
            }
            WorkerMessage::Request(_) => Err(NetError::UnexpectedMessage(
                "worker sent a request instead of a response".to_owned(),
            )),
        }
    }
}
