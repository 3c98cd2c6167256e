//! Task records and the scheduling queue.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use meridian_proto::{Arg, ObjRef, OperationId, TaskSnapshot, TaskStatusProto, WorkerId};

use crate::error::{Result, SchedulerError};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting in the queue (possibly matched, awaiting transfers).
    Queued,
    /// Dispatched to a worker.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Raised during execution or failed in transfer.
    Failed,
}

impl TaskStatus {
    /// Converts to the protocol representation.
    #[must_use]
    pub const fn to_proto(self) -> TaskStatusProto {
        match self {
            Self::Queued => TaskStatusProto::Queued,
            Self::Running => TaskStatusProto::Running,
            Self::Succeeded => TaskStatusProto::Succeeded,
            Self::Failed => TaskStatusProto::Failed,
        }
    }

    /// Whether the task has finished (successfully or not).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One task record, owned by the scheduler.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub operation_id: OperationId,
    pub function: String,
    pub args: Vec<Arg>,
    /// References allocated at submission time, in return order.
    pub result_refs: Vec<ObjRef>,
    pub assigned_worker: Option<WorkerId>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
}

impl TaskRecord {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            operation_id: self.operation_id,
            function: self.function.clone(),
            status: self.status.to_proto(),
            assigned_worker: self.assigned_worker,
            result_refs: self.result_refs.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// A task matched to a worker but awaiting object transfers.
///
/// Parked tasks are off the queue and are not re-matched; the chosen
/// worker stays reserved until every missing canonical lands on its store
/// or a transfer fails.
#[derive(Debug, Clone)]
pub struct PendingDispatch {
    pub worker: WorkerId,
    /// Canonical refs not yet present on the worker's store.
    pub missing: BTreeSet<ObjRef>,
}

/// Task table plus the FIFO scheduling queue.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: BTreeMap<OperationId, TaskRecord>,
    queue: VecDeque<OperationId>,
    pending: BTreeMap<OperationId, PendingDispatch>,
    next_operation_id: u64,
}

impl TaskTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task record and appends it to the queue.
    pub fn enqueue(
        &mut self,
        function: impl Into<String>,
        args: Vec<Arg>,
        result_refs: Vec<ObjRef>,
    ) -> OperationId {
        self.next_operation_id += 1;
        let operation_id = OperationId::new(self.next_operation_id);
        self.tasks.insert(
            operation_id,
            TaskRecord {
                operation_id,
                function: function.into(),
                args,
                result_refs,
                assigned_worker: None,
                status: TaskStatus::Queued,
                error_message: None,
            },
        );
        self.queue.push_back(operation_id);
        operation_id
    }

    /// Gets a task record.
    pub fn get(&self, operation_id: OperationId) -> Result<&TaskRecord> {
        self.tasks.get(&operation_id).ok_or_else(|| {
            SchedulerError::ProtocolViolation(format!("unknown operation {operation_id}"))
        })
    }

    /// Gets a mutable task record.
    pub fn get_mut(&mut self, operation_id: OperationId) -> Result<&mut TaskRecord> {
        self.tasks.get_mut(&operation_id).ok_or_else(|| {
            SchedulerError::ProtocolViolation(format!("unknown operation {operation_id}"))
        })
    }

    /// Snapshot of the queue, oldest first.
    #[must_use]
    pub fn queued(&self) -> Vec<OperationId> {
        self.queue.iter().copied().collect()
    }

    /// Removes an operation from the queue (it was matched or failed).
    pub fn unqueue(&mut self, operation_id: OperationId) {
        self.queue.retain(|op| *op != operation_id);
    }

    /// Parks a matched task while transfers are in flight.
    pub fn park(&mut self, operation_id: OperationId, worker: WorkerId, missing: BTreeSet<ObjRef>) {
        self.pending
            .insert(operation_id, PendingDispatch { worker, missing });
    }

    /// Gets the pending dispatch for an operation, if parked.
    #[must_use]
    pub fn pending(&self, operation_id: OperationId) -> Option<&PendingDispatch> {
        self.pending.get(&operation_id)
    }

    /// Records that `canonical` became available on `worker_store`'s node,
    /// returning the operations whose last missing argument this was.
    pub fn transfer_landed(
        &mut self,
        canonical: ObjRef,
        parked_on_store: impl Fn(WorkerId) -> bool,
    ) -> Vec<OperationId> {
        let mut ready = Vec::new();
        for (op, pending) in &mut self.pending {
            if parked_on_store(pending.worker) && pending.missing.remove(&canonical) && pending.missing.is_empty() {
                ready.push(*op);
            }
        }
        for op in &ready {
            self.pending.remove(op);
        }
        ready
    }

    /// Removes and returns every parked operation whose missing set
    /// contains `canonical` and whose worker satisfies the predicate.
    /// Used when a transfer permanently fails.
    pub fn fail_pending_on(
        &mut self,
        canonical: ObjRef,
        parked_on_store: impl Fn(WorkerId) -> bool,
    ) -> Vec<(OperationId, WorkerId)> {
        let failed: Vec<(OperationId, WorkerId)> = self
            .pending
            .iter()
            .filter(|(_, p)| parked_on_store(p.worker) && p.missing.contains(&canonical))
            .map(|(op, p)| (*op, p.worker))
            .collect();
        for (op, _) in &failed {
            self.pending.remove(op);
        }
        failed
    }

    /// Removes a parked dispatch outright (task failed for another reason).
    pub fn unpark(&mut self, operation_id: OperationId) -> Option<PendingDispatch> {
        self.pending.remove(&operation_id)
    }

    /// Snapshots every task record, in operation order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.tasks.values().map(TaskRecord::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let mut table = TaskTable::new();
        let a = table.enqueue("f", vec![], vec![ObjRef::new(1)]);
        let b = table.enqueue("g", vec![], vec![ObjRef::new(2)]);
        assert_eq!(table.queued(), vec![a, b]);

        table.unqueue(a);
        assert_eq!(table.queued(), vec![b]);
    }

    #[test]
    fn operation_ids_are_monotonic() {
        let mut table = TaskTable::new();
        let a = table.enqueue("f", vec![], vec![]);
        let b = table.enqueue("f", vec![], vec![]);
        assert!(b > a);
    }

    #[test]
    fn transfer_landed_releases_when_missing_set_drains() {
        let mut table = TaskTable::new();
        let op = table.enqueue("f", vec![], vec![]);
        table.unqueue(op);

        let worker = WorkerId::new(1);
        let r1 = ObjRef::new(10);
        let r2 = ObjRef::new(11);
        table.park(op, worker, BTreeSet::from([r1, r2]));

        let ready = table.transfer_landed(r1, |w| w == worker);
        assert!(ready.is_empty());

        let ready = table.transfer_landed(r2, |w| w == worker);
        assert_eq!(ready, vec![op]);
        assert!(table.pending(op).is_none());
    }

    #[test]
    fn transfer_landed_ignores_other_workers() {
        let mut table = TaskTable::new();
        let op = table.enqueue("f", vec![], vec![]);
        table.unqueue(op);

        let worker = WorkerId::new(1);
        let r = ObjRef::new(10);
        table.park(op, worker, BTreeSet::from([r]));

        let ready = table.transfer_landed(r, |_| false);
        assert!(ready.is_empty());
        assert!(table.pending(op).is_some());
    }

    #[test]
    fn fail_pending_collects_dependents() {
        let mut table = TaskTable::new();
        let op = table.enqueue("f", vec![], vec![]);
        table.unqueue(op);

        let worker = WorkerId::new(1);
        let r = ObjRef::new(10);
        table.park(op, worker, BTreeSet::from([r]));

        let failed = table.fail_pending_on(r, |w| w == worker);
        assert_eq!(failed, vec![(op, worker)]);
        assert!(table.pending(op).is_none());
    }
}
