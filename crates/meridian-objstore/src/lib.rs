//! Meridian object store - the per-node data plane.
//!
//! Each node runs one store holding the payloads of canonical object
//! references. The store:
//!
//! - accepts streamed transfers from peer stores on scheduler command
//! - serves streamed reads to peers and to co-located workers
//! - resolves local aliases installed by the scheduler
//! - frees memory when the scheduler's garbage collector says so
//!
//! Finalized payloads are immutable and owned by exactly one buffer; an
//! alias never duplicates storage.

pub mod config;
pub mod delivery;
pub mod error;
pub mod service;
pub mod store;

// Re-export main types
pub use config::ObjStoreConfig;
pub use error::{Result, StoreError};
pub use service::ObjStoreService;
pub use store::{DeliveryTicket, LocalStore, Payload};
