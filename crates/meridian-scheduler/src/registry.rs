//! Registries for workers, object stores, and functions.
//!
//! All three live inside the single-threaded scheduler state; maps are
//! ordered so iteration (and therefore scheduling) is deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use meridian_proto::{
    FunctionSnapshot, ObjStoreId, OperationId, WorkerId, WorkerSnapshot, WorkerStateProto,
};
use tracing::info;

use crate::error::{Result, SchedulerError};

/// Worker execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Registered, has not yet asked for work.
    Registering,
    /// Waiting for a task.
    Idle,
    /// Reserved for or executing a task.
    Busy,
}

impl WorkerState {
    /// Converts to the protocol representation.
    #[must_use]
    pub const fn to_proto(self) -> WorkerStateProto {
        match self {
            Self::Registering => WorkerStateProto::Registering,
            Self::Idle => WorkerStateProto::Idle,
            Self::Busy => WorkerStateProto::Busy,
        }
    }
}

/// One registered worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Scheduler-assigned identifier.
    pub id: WorkerId,
    /// Address the worker serves `ExecuteTask` on.
    pub address: String,
    /// The worker's co-located object store.
    pub objstore: ObjStoreId,
    /// Execution state.
    pub state: WorkerState,
    /// Operation currently reserved for or running on this worker.
    pub current_task: Option<OperationId>,
}

impl WorkerRecord {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.id,
            address: self.address.clone(),
            objstore_id: self.objstore,
            state: self.state.to_proto(),
            current_task: self.current_task,
        }
    }
}

/// One registered object store.
#[derive(Debug, Clone)]
pub struct ObjStoreRecord {
    /// Scheduler-assigned identifier.
    pub id: ObjStoreId,
    /// Address the store serves its RPCs on.
    pub address: String,
}

/// One function table entry.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// Number of values the function returns. Must agree across all
    /// registrations.
    pub arity: u32,
    /// Workers eligible to execute the function.
    pub workers: BTreeSet<WorkerId>,
}

/// Registry of workers, object stores, and functions.
#[derive(Debug, Default)]
pub struct Registry {
    workers: BTreeMap<WorkerId, WorkerRecord>,
    objstores: BTreeMap<ObjStoreId, ObjStoreRecord>,
    functions: HashMap<String, FunctionInfo>,
    next_worker_id: u64,
    next_objstore_id: u64,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an object store and assigns a fresh id.
    pub fn register_objstore(&mut self, address: impl Into<String>) -> ObjStoreId {
        self.next_objstore_id += 1;
        let id = ObjStoreId::new(self.next_objstore_id);
        let address = address.into();
        info!(objstore_id = %id, %address, "object store registered");
        self.objstores.insert(id, ObjStoreRecord { id, address });
        id
    }

    /// Registers a worker. Its object store must already be registered
    /// under `objstore_addr`.
    pub fn register_worker(
        &mut self,
        worker_addr: impl Into<String>,
        objstore_addr: &str,
    ) -> Result<(WorkerId, ObjStoreId)> {
        let objstore = self
            .objstore_by_addr(objstore_addr)
            .ok_or_else(|| SchedulerError::UnknownObjStoreAddress(objstore_addr.to_owned()))?;

        self.next_worker_id += 1;
        let id = WorkerId::new(self.next_worker_id);
        let address = worker_addr.into();
        info!(worker_id = %id, %address, objstore_id = %objstore, "worker registered");
        self.workers.insert(
            id,
            WorkerRecord {
                id,
                address,
                objstore,
                state: WorkerState::Registering,
                current_task: None,
            },
        );
        Ok((id, objstore))
    }

    /// Adds a worker to a function's eligible set. Records the arity on
    /// first registration; later registrations must agree.
    pub fn register_function(
        &mut self,
        worker_id: WorkerId,
        function: impl Into<String>,
        arity: u32,
    ) -> Result<()> {
        if !self.workers.contains_key(&worker_id) {
            return Err(SchedulerError::UnknownWorker(worker_id));
        }

        let function = function.into();
        match self.functions.get_mut(&function) {
            Some(info) => {
                if info.arity != arity {
                    return Err(SchedulerError::ArityMismatch {
                        function,
                        registered: info.arity,
                        offered: arity,
                    });
                }
                info.workers.insert(worker_id);
            }
            None => {
                info!(%function, arity, worker_id = %worker_id, "function registered");
                self.functions.insert(
                    function,
                    FunctionInfo {
                        arity,
                        workers: BTreeSet::from([worker_id]),
                    },
                );
            }
        }
        Ok(())
    }

    /// Gets a worker record.
    pub fn worker(&self, id: WorkerId) -> Result<&WorkerRecord> {
        self.workers.get(&id).ok_or(SchedulerError::UnknownWorker(id))
    }

    /// Gets a mutable worker record.
    pub fn worker_mut(&mut self, id: WorkerId) -> Result<&mut WorkerRecord> {
        self.workers
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownWorker(id))
    }

    /// Gets an object store record.
    pub fn objstore(&self, id: ObjStoreId) -> Result<&ObjStoreRecord> {
        self.objstores
            .get(&id)
            .ok_or(SchedulerError::UnknownObjStore(id))
    }

    /// Looks up an object store by address.
    #[must_use]
    pub fn objstore_by_addr(&self, address: &str) -> Option<ObjStoreId> {
        self.objstores
            .values()
            .find(|r| r.address == address)
            .map(|r| r.id)
    }

    /// Gets a function table entry.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.get(name)
    }

    /// Idle workers eligible for a function, in id order.
    #[must_use]
    pub fn idle_workers_for(&self, function: &str) -> Vec<WorkerId> {
        let Some(info) = self.functions.get(function) else {
            return Vec::new();
        };
        info.workers
            .iter()
            .copied()
            .filter(|id| {
                self.workers
                    .get(id)
                    .is_some_and(|w| w.state == WorkerState::Idle)
            })
            .collect()
    }

    /// All worker snapshots, in id order.
    #[must_use]
    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers.values().map(WorkerRecord::snapshot).collect()
    }

    /// All object stores as `(id, address)` pairs, in id order.
    #[must_use]
    pub fn objstore_snapshots(&self) -> Vec<(ObjStoreId, String)> {
        self.objstores
            .values()
            .map(|r| (r.id, r.address.clone()))
            .collect()
    }

    /// All function snapshots, sorted by name.
    #[must_use]
    pub fn function_snapshots(&self) -> Vec<FunctionSnapshot> {
        let mut snapshots: Vec<FunctionSnapshot> = self
            .functions
            .iter()
            .map(|(name, info)| FunctionSnapshot {
                name: name.clone(),
                arity: info.arity,
                workers: info.workers.iter().copied().collect(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_requires_registered_objstore() {
        let mut registry = Registry::new();

        let err = registry
            .register_worker("127.0.0.1:40001", "127.0.0.1:20001")
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownObjStoreAddress(_)));

        let store = registry.register_objstore("127.0.0.1:20001");
        let (worker, worker_store) = registry
            .register_worker("127.0.0.1:40001", "127.0.0.1:20001")
            .unwrap();
        assert_eq!(worker_store, store);
        assert_eq!(
            registry.worker(worker).unwrap().state,
            WorkerState::Registering
        );
    }

    #[test]
    fn ids_are_monotonic() {
        let mut registry = Registry::new();
        let s1 = registry.register_objstore("a");
        let s2 = registry.register_objstore("b");
        assert!(s2 > s1);

        let (w1, _) = registry.register_worker("wa", "a").unwrap();
        let (w2, _) = registry.register_worker("wb", "b").unwrap();
        assert!(w2 > w1);
    }

    #[test]
    fn function_arity_must_agree() {
        let mut registry = Registry::new();
        registry.register_objstore("a");
        let (w1, _) = registry.register_worker("wa", "a").unwrap();
        let (w2, _) = registry.register_worker("wb", "a").unwrap();

        registry.register_function(w1, "id", 1).unwrap();
        registry.register_function(w2, "id", 1).unwrap();

        let err = registry.register_function(w2, "id", 2).unwrap_err();
        assert!(matches!(err, SchedulerError::ArityMismatch { .. }));

        // The offending registration did not alter the eligible set.
        let info = registry.function("id").unwrap();
        assert_eq!(info.arity, 1);
        assert_eq!(info.workers.len(), 2);
    }

    #[test]
    fn idle_workers_filtered_by_state() {
        let mut registry = Registry::new();
        registry.register_objstore("a");
        let (w1, _) = registry.register_worker("wa", "a").unwrap();
        let (w2, _) = registry.register_worker("wb", "a").unwrap();
        registry.register_function(w1, "id", 1).unwrap();
        registry.register_function(w2, "id", 1).unwrap();

        // Both still registering: no idle workers.
        assert!(registry.idle_workers_for("id").is_empty());

        registry.worker_mut(w1).unwrap().state = WorkerState::Idle;
        assert_eq!(registry.idle_workers_for("id"), vec![w1]);

        registry.worker_mut(w2).unwrap().state = WorkerState::Idle;
        assert_eq!(registry.idle_workers_for("id"), vec![w1, w2]);
    }
}
