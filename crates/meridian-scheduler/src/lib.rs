//! Meridian scheduler - the cluster's control plane.
//!
//! The scheduler is the authoritative registry of:
//!
//! - **Workers and object stores**: registration, addresses, states
//! - **Functions**: name → eligible worker set and return arity
//! - **Object references**: aliasing, locations, readiness, and the
//!   distributed reference-count garbage collector
//! - **Tasks**: the FIFO queue, matching, and dispatch
//!
//! # Architecture
//!
//! The state is logically single-threaded behind one lock. Wire handlers
//! mutate it and collect side-effect actions (deliveries, alias
//! notifications, deallocations, dispatches) that run as background peer
//! RPCs after the lock is released; their completions re-enter as fresh
//! events. This keeps the event order serializable and scheduling
//! deterministic for a fixed event order.
//!
//! Restarting the scheduler reinitialises the cluster: nothing persists.

pub mod api;
pub mod config;
pub mod error;
pub mod objects;
pub mod registry;
pub mod service;
pub mod state;
pub mod tasks;

// Re-export main types
pub use config::{ApiConfig, DeliveryConfig, ListenConfig, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use objects::{AliasEffect, ObjectTable, Retirement};
pub use registry::{Registry, WorkerRecord, WorkerState};
pub use service::SchedulerService;
pub use state::{Action, SchedulerState};
pub use tasks::{TaskRecord, TaskStatus, TaskTable};
