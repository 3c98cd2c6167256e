//! Wire protocol types for Meridian inter-component communication.
//!
//! Meridian runs three service classes: the singleton scheduler, one object
//! store per node, and many workers. This crate defines the framed wire
//! protocol they speak, based on rkyv serialisation:
//!
//! - Scheduler operations (registration, task submission, object-reference
//!   lifecycle, reference counting)
//! - Object store operations (streamed transfers, alias installation,
//!   deallocation)
//! - Worker dispatch (task execution)
//!
//! # Wire Format
//!
//! All messages use a common envelope format with an 8-byte frame header:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Frame Header (8 bytes, fixed)               │
//! ├──────────────┬──────────────┬────────────────────────────┤
//! │  Version (2) │ Msg Type (2) │    Payload Length (4)      │
//! ├──────────────┴──────────────┴────────────────────────────┤
//! │                 rkyv-serialised Envelope                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Streaming operations (object transfers) are carried as a request frame
//! followed by a run of chunk frames; each chunk repeats the object's total
//! size and metadata offset, and the stream is complete when the receiver
//! has accumulated `total_size` bytes.

pub mod codec;
mod envelope;
mod error;
mod objstore;
mod scheduler;
mod task;
mod types;
mod worker;

pub use codec::{decode_payload, Codec, FrameHeader, MessageType, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use envelope::{Envelope, EnvelopeHeader};
pub use error::{ErrorCode, ProtocolError};
pub use objstore::{
    ObjChunk, ObjSnapshot, ObjStoreMessage, ObjStoreRequest, ObjStoreResponse, MAX_CHUNK_DATA,
};
pub use scheduler::{
    FunctionSnapshot, ObjectSnapshot, SchedulerMessage, SchedulerRequest, SchedulerResponse,
    SchedulerSnapshot, TaskOutcome, TaskSnapshot, TaskStatusProto, WorkerSnapshot, WorkerStateProto,
};
pub use task::{Arg, TaskDispatch, TaskSpec};
pub use types::{CorrelationId, ObjRef, ObjStoreId, OperationId, WorkerId};
pub use worker::{WorkerMessage, WorkerRequest, WorkerResponse};

/// Protocol version constants.
pub mod version {
    /// Current protocol version.
    pub const CURRENT: u16 = 1;

    /// Minimum supported protocol version.
    pub const MIN_SUPPORTED: u16 = 1;
}
