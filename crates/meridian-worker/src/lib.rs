//! Meridian worker - executes tasks dispatched by the scheduler.
//!
//! A worker serves one function table and runs one task at a time:
//! arguments are pulled through the co-located object store, results are
//! written back to it, and the outcome is reported to the scheduler via
//! `ReadyForNewTask`. Task functions get a [`TaskContext`] able to read
//! cluster objects, publish new ones, and submit nested tasks whose
//! results alias the outer task's result refs.

pub mod config;
pub mod error;
pub mod functions;
pub mod runtime;

// Re-export main types
pub use config::WorkerConfig;
pub use error::{Result, TaskError, WorkerError};
pub use functions::{FunctionRegistry, RegisteredFunction, ReturnValue, TaskContext, TaskFunction};
pub use runtime::WorkerRuntime;
