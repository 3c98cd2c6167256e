//! Framed transport and typed RPC clients for Meridian services.
//!
//! The wire protocol is defined in `meridian-proto`; this crate provides
//! the async plumbing around it:
//!
//! - [`framing`]: reading and writing length-delimited frames over any
//!   `AsyncRead + AsyncWrite` stream
//! - [`client`]: one typed request/response client per service
//!   ([`SchedulerClient`], [`ObjStoreClient`], [`WorkerClient`]), including
//!   the chunk loops for streamed object transfers

pub mod client;
pub mod framing;

mod error;

pub use client::{ObjStoreClient, ObjStream, SchedulerClient, WorkerClient};
pub use error::{NetError, Result};
