//! Object store protocol messages.
//!
//! Streamed transfers (`StreamObjTo`, `GetObj` outbound, `PutObj` inbound)
//! are a request frame followed by a run of chunk frames. Every chunk
//! repeats the object's `total_size` and `metadata_offset`; receivers treat
//! the first chunk as authoritative and validate that the values stay
//! invariant across the stream. The stream ends when the accumulated data
//! reaches `total_size` bytes.

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::types::ObjRef;

/// Maximum data bytes carried by a single chunk.
///
/// Chosen so a chunk frame stays well under the frame size limit.
pub const MAX_CHUNK_DATA: usize = 1024 * 1024;

/// Object store message types.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ObjStoreMessage {
    /// Request to the object store.
    Request(ObjStoreRequest),
    /// Response from the object store.
    Response(ObjStoreResponse),
}

/// Requests accepted by the object store service.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ObjStoreRequest {
    /// Instructs the store to pull `objref` from the store at `src_addr`.
    ///
    /// The response is sent once the transfer finalizes (or fails); a
    /// duplicate request for an in-flight transfer attaches to it instead
    /// of starting a second one.
    StartDelivery { src_addr: String, objref: ObjRef },
    /// Opens an outbound stream of the finalized payload for `objref`.
    StreamObjTo { objref: ObjRef },
    /// Installs a local alias so lookups of `alias` resolve to `canonical`.
    NotifyAlias { alias: ObjRef, canonical: ObjRef },
    /// Frees the payload for `canonical`. Idempotent.
    DeallocateObject { canonical: ObjRef },
    /// Diagnostic snapshot. An empty list requests all held objects.
    ObjStoreInfo { objrefs: Vec<ObjRef> },
    /// Worker-facing read; blocks until the object is resolvable locally.
    GetObj { objref: ObjRef },
    /// Worker-facing write; chunk frames follow this request.
    PutObj { objref: ObjRef },
    /// One chunk of a `PutObj` upload.
    Chunk(ObjChunk),
    /// Records a failed result so readers observe the task's error.
    PutFailed { objref: ObjRef, error_message: String },
}

/// Responses produced by the object store service.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ObjStoreResponse {
    /// Generic acknowledgement.
    Ack,
    /// One chunk of a streamed payload.
    Chunk(ObjChunk),
    /// Diagnostic snapshot.
    Info(Vec<ObjSnapshot>),
    /// The request failed.
    Error { code: ErrorCode, message: String },
}

impl ObjStoreResponse {
    /// Creates an error response.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// One chunk of an object payload.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjChunk {
    /// Total payload size in bytes, repeated on every chunk.
    pub total_size: u64,
    /// Boundary between the serialised-object prefix and the binary-buffer
    /// suffix, repeated on every chunk.
    pub metadata_offset: u64,
    /// Chunk data, written at the receiver's running offset.
    pub data: Vec<u8>,
}

impl ObjChunk {
    /// Checks that another chunk of the same stream carries the same
    /// metadata as this (authoritative, first) chunk.
    #[must_use]
    pub fn is_consistent_with(&self, other: &Self) -> bool {
        self.total_size == other.total_size && self.metadata_offset == other.metadata_offset
    }
}

/// Diagnostic snapshot of one held object.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjSnapshot {
    pub objref: ObjRef,
    pub total_size: u64,
    pub metadata_offset: u64,
    pub finalized: bool,
    /// Error message when the object records a failed result.
    pub failed: Option<String>,
}
