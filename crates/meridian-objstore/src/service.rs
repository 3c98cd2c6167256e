//! The object store's wire service.
//!
//! Handles scheduler commands (deliveries, alias installation,
//! deallocation), peer reads (`StreamObjTo`), and worker traffic
//! (`GetObj`, `PutObj`, `PutFailed`). Streamed payloads are written as a
//! run of chunk frames that all echo the request's correlation id.

use std::sync::Arc;

use meridian_net::{framing, NetError, SchedulerClient};
use meridian_proto::{
    decode_payload, Codec, Envelope, EnvelopeHeader, MessageType, ObjChunk, ObjRef, ObjStoreId,
    ObjStoreMessage, ObjStoreRequest, ObjStoreResponse, MAX_CHUNK_DATA,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::delivery;
use crate::error::{Result, StoreError};
use crate::store::{DeliveryTicket, LocalStore, Payload};

/// The object store service.
pub struct ObjStoreService {
    store: LocalStore,
    scheduler: SchedulerClient,
    objstore_id: ObjStoreId,
}

impl ObjStoreService {
    /// Creates a service for a store already registered with the
    /// scheduler.
    #[must_use]
    pub fn new(store: LocalStore, scheduler: SchedulerClient, objstore_id: ObjStoreId) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            objstore_id,
        })
    }

    /// The local object map.
    #[must_use]
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// This store's scheduler-assigned id.
    #[must_use]
    pub const fn objstore_id(&self) -> ObjStoreId {
        self.objstore_id
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
                    debug!(%peer, "object store connection accepted");
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_connection(stream).await {
                            warn!(%peer, error = %e, "object store connection error");
                        }
                    });
                }
            }
        }
    }

    /// Handles one connection, processing requests until it closes.
    pub async fn handle_connection(&self, mut stream: TcpStream) -> std::result::Result<(), NetError> {
        let mut codec = Codec::with_capacity(8192);
        loop {
            let Some((header, payload)) = framing::read_frame(&mut stream).await? else {
                return Ok(());
            };
            if header.message_type != MessageType::ObjStore {
                warn!("received non-objstore message type: {:?}", header.message_type);
                continue;
            }

            let envelope: Envelope<ObjStoreMessage> = decode_payload(&payload)?;
            let request = match envelope.payload {
                ObjStoreMessage::Request(request) => request,
                ObjStoreMessage::Response(_) => {
                    warn!("received response instead of request");
                    continue;
                }
            };

            let outcome = self
                .handle_request(request, &envelope.header, &mut stream, &mut codec)
                .await;
            match outcome {
                Ok(()) => {}
                Err(StoreError::Net(e)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "object store request rejected");
                    let response = ObjStoreResponse::error(e.code(), e.to_string());
                    send_response(&mut stream, &mut codec, &envelope.header, response).await?;
                }
            }
        }
    }

    async fn handle_request(
        &self,
        request: ObjStoreRequest,
        header: &EnvelopeHeader,
        stream: &mut TcpStream,
        codec: &mut Codec,
    ) -> Result<()> {
        match request {
            ObjStoreRequest::StartDelivery { src_addr, objref } => {
                self.handle_start_delivery(&src_addr, objref).await?;
                send_response(stream, codec, header, ObjStoreResponse::Ack).await?;
            }
            ObjStoreRequest::StreamObjTo { objref } => {
                // Only finalized payloads may leave the store.
                let payload = match self.store.get_finalized(objref) {
                    Some(Ok(payload)) => payload,
                    Some(Err(e)) => return Err(e),
                    None if self.store.delivery_in_flight(objref) => {
                        return Err(StoreError::NotFinalized(objref))
                    }
                    None => return Err(StoreError::ObjectNotFound(objref)),
                };
                stream_payload(stream, codec, header, &payload).await?;
            }
            ObjStoreRequest::NotifyAlias { alias, canonical } => {
                self.store.install_alias(alias, canonical);
                send_response(stream, codec, header, ObjStoreResponse::Ack).await?;
            }
            ObjStoreRequest::DeallocateObject { canonical } => {
                self.store.deallocate(canonical);
                send_response(stream, codec, header, ObjStoreResponse::Ack).await?;
            }
            ObjStoreRequest::ObjStoreInfo { objrefs } => {
                let info = self.store.snapshot(&objrefs);
                send_response(stream, codec, header, ObjStoreResponse::Info(info)).await?;
            }
            ObjStoreRequest::GetObj { objref } => {
                let payload = self.store.wait_resolved(objref).await?;
                stream_payload(stream, codec, header, &payload).await?;
            }
            ObjStoreRequest::PutObj { objref } => {
                let payload = receive_upload(stream, objref).await?;
                self.store.insert_finalized(objref, payload);
                self.report_ready(objref).await?;
                send_response(stream, codec, header, ObjStoreResponse::Ack).await?;
            }
            ObjStoreRequest::Chunk(_) => {
                return Err(StoreError::ProtocolViolation(
                    "chunk outside an upload".to_owned(),
                ));
            }
            ObjStoreRequest::PutFailed {
                objref,
                error_message,
            } => {
                self.store.insert_failed(objref, error_message);
                // Readiness still propagates so dependents run and observe
                // the failure at read time.
                self.report_ready(objref).await?;
                send_response(stream, codec, header, ObjStoreResponse::Ack).await?;
            }
        }
        Ok(())
    }

    /// Runs (or attaches to) the pull of `objref` from `src_addr`.
    async fn handle_start_delivery(&self, src_addr: &str, objref: ObjRef) -> Result<()> {
        match self.store.begin_delivery(objref) {
            DeliveryTicket::AlreadyPresent => Ok(()),
            DeliveryTicket::InFlight => self.store.wait_delivery_settled(objref).await,
            DeliveryTicket::Started(guard) => {
                let result = delivery::pull_object(src_addr, objref, &self.store).await;
                drop(guard);
                match result {
                    Ok(_) => {
                        self.report_ready(objref).await?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Reports readiness to the scheduler without tearing down the
    /// requesting connection when the callback fails.
    async fn report_ready(&self, objref: ObjRef) -> Result<()> {
        self.scheduler
            .obj_ready(objref, self.objstore_id)
            .await
            .map_err(|e| StoreError::SchedulerCallback(e.to_string()))
    }
}

/// Sends one response frame echoing the request's correlation id.
async fn send_response(
    stream: &mut TcpStream,
    codec: &mut Codec,
    request_header: &EnvelopeHeader,
    response: ObjStoreResponse,
) -> std::result::Result<(), NetError> {
    let envelope = Envelope::response_to(request_header, ObjStoreMessage::Response(response));
    let frame = codec
        .frame(MessageType::ObjStore, &envelope)
        .map_err(NetError::from)?
        .to_vec();
    framing::write_frame(stream, &frame).await.map_err(NetError::from)
}

/// Streams a payload as chunk frames. Always at least one chunk, so
/// zero-length payloads still deliver their metadata.
async fn stream_payload(
    stream: &mut TcpStream,
    codec: &mut Codec,
    request_header: &EnvelopeHeader,
    payload: &Payload,
) -> Result<()> {
    let total_size = payload.total_size();
    let mut offset = 0usize;
    loop {
        let end = usize::min(offset + MAX_CHUNK_DATA, payload.data.len());
        let chunk = ObjChunk {
            total_size,
            metadata_offset: payload.metadata_offset,
            data: payload.data[offset..end].to_vec(),
        };
        send_response(stream, codec, request_header, ObjStoreResponse::Chunk(chunk)).await?;

        offset = end;
        if offset >= payload.data.len() {
            return Ok(());
        }
    }
}

/// Receives a chunked upload, validating the repeated metadata.
async fn receive_upload(stream: &mut TcpStream, objref: ObjRef) -> Result<Payload> {
    let mut first: Option<(u64, u64)> = None;
    let mut buf = bytes::BytesMut::new();

    loop {
        let payload = framing::read_frame_expecting(stream, MessageType::ObjStore)
            .await
            .map_err(StoreError::from)?;
        let envelope: Envelope<ObjStoreMessage> =
            decode_payload(&payload).map_err(NetError::from)?;
        let chunk = match envelope.payload {
            ObjStoreMessage::Request(ObjStoreRequest::Chunk(chunk)) => chunk,
            other => {
                return Err(StoreError::ProtocolViolation(format!(
                    "expected upload chunk, got {other:?}"
                )))
            }
        };

        match first {
            None => {
                // First chunk is authoritative; pre-allocate from it.
                buf.reserve(chunk.total_size as usize);
                first = Some((chunk.total_size, chunk.metadata_offset));
            }
            Some((total_size, metadata_offset)) => {
                if chunk.total_size != total_size || chunk.metadata_offset != metadata_offset {
                    return Err(StoreError::ChunkMismatch(objref));
                }
            }
        }

        let (total_size, metadata_offset) = first.unwrap_or((0, 0));
        buf.extend_from_slice(&chunk.data);
        if buf.len() as u64 > total_size {
            return Err(StoreError::ProtocolViolation(format!(
                "upload of {objref} overran declared size"
            )));
        }
        if buf.len() as u64 == total_size {
            return Ok(Payload {
                metadata_offset,
                data: buf.freeze(),
            });
        }
    }
}
