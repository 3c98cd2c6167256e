//! Builders for exercising scheduler state without a network.

use meridian_proto::{ObjRef, ObjStoreId, ObjectSnapshot, OperationId, TaskSnapshot, WorkerId};
use meridian_scheduler::{DeliveryConfig, SchedulerState};

/// A scheduler state with node-building conveniences.
pub struct TestScheduler {
    pub state: SchedulerState,
}

impl TestScheduler {
    /// Fresh state with the default delivery policy.
    pub fn new() -> Self {
        Self {
            state: SchedulerState::new(&DeliveryConfig::default()),
        }
    }

    /// Registers an object store plus a co-located worker, and reports the
    /// worker ready so it can be matched.
    pub fn add_node(&mut self, store_addr: &str, worker_addr: &str) -> (WorkerId, ObjStoreId) {
        self.state.register_objstore(store_addr);
        let (worker, store) = self
            .state
            .register_worker(worker_addr, store_addr)
            .expect("objstore was just registered");
        self.state
            .ready_for_new_task(worker, None)
            .expect("worker was just registered");
        (worker, store)
    }

    /// Registers an object store with no worker.
    pub fn add_store(&mut self, store_addr: &str) -> ObjStoreId {
        self.state.register_objstore(store_addr)
    }

    /// The object record for `objref`, from a state snapshot.
    pub fn object(&self, objref: ObjRef) -> ObjectSnapshot {
        self.state
            .snapshot()
            .objects
            .into_iter()
            .find(|o| o.objref == objref)
            .unwrap_or_else(|| panic!("object {objref} not in snapshot"))
    }

    /// The task record for `operation_id`.
    pub fn task(&self, operation_id: OperationId) -> TaskSnapshot {
        self.state
            .task_snapshots()
            .into_iter()
            .find(|t| t.operation_id == operation_id)
            .unwrap_or_else(|| panic!("operation {operation_id} not in snapshot"))
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}
