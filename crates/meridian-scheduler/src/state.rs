//! The scheduler's authoritative state and event handlers.
//!
//! The scheduler is logically single-threaded: every wire operation locks
//! the one `SchedulerState`, mutates it, and collects the side effects to
//! perform — deliveries to start, aliases to announce, deallocations to
//! issue, tasks to dispatch — as [`Action`] values. The service layer
//! executes actions after releasing the lock, so peer RPC completions
//! re-enter as fresh events and the event order stays serializable.

use std::collections::{BTreeMap, BTreeSet};

use meridian_proto::{
    Arg, ObjRef, ObjStoreId, OperationId, SchedulerSnapshot, TaskDispatch, TaskOutcome,
    TaskSnapshot, TaskSpec, WorkerId,
};
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::error::{Result, SchedulerError};
use crate::objects::{ObjectTable, Retirement};
use crate::registry::{Registry, WorkerState};
use crate::tasks::{TaskStatus, TaskTable};

/// A side effect to perform outside the state lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Tell `store` to pull `objref` from the store at `src_addr`.
    StartDelivery {
        store: ObjStoreId,
        store_addr: String,
        src_addr: String,
        objref: ObjRef,
    },
    /// Tell the store at `store_addr` about a new alias.
    NotifyAlias {
        store_addr: String,
        alias: ObjRef,
        canonical: ObjRef,
    },
    /// Tell the store at `store_addr` to free a retired payload.
    Deallocate { store_addr: String, objref: ObjRef },
    /// Dispatch a task to a worker.
    Execute {
        worker: WorkerId,
        worker_addr: String,
        dispatch: TaskDispatch,
    },
}

#[derive(Debug)]
struct DeliveryState {
    attempts: u32,
    tried: BTreeSet<ObjStoreId>,
}

/// The scheduler's complete in-memory state.
#[derive(Debug)]
pub struct SchedulerState {
    registry: Registry,
    objects: ObjectTable,
    tasks: TaskTable,
    /// In-flight deliveries keyed by `(destination store, canonical)`.
    deliveries: BTreeMap<(ObjStoreId, ObjRef), DeliveryState>,
    /// Destinations waiting for a not-yet-ready ref, from `RequestObj`.
    wanted: BTreeMap<ObjRef, BTreeSet<ObjStoreId>>,
    max_delivery_attempts: u32,
}

impl SchedulerState {
    /// Creates empty state with the given delivery policy.
    #[must_use]
    pub fn new(delivery: &DeliveryConfig) -> Self {
        Self {
            registry: Registry::new(),
            objects: ObjectTable::new(),
            tasks: TaskTable::new(),
            deliveries: BTreeMap::new(),
            wanted: BTreeMap::new(),
            max_delivery_attempts: delivery.max_attempts.max(1),
        }
    }

    /// Registers an object store.
    pub fn register_objstore(&mut self, addr: impl Into<String>) -> ObjStoreId {
        self.registry.register_objstore(addr)
    }

    /// Registers a worker whose store is already registered.
    pub fn register_worker(
        &mut self,
        worker_addr: impl Into<String>,
        objstore_addr: &str,
    ) -> Result<(WorkerId, ObjStoreId)> {
        self.registry.register_worker(worker_addr, objstore_addr)
    }

    /// Adds a worker to a function's eligible set and re-runs matching.
    pub fn register_function(
        &mut self,
        worker_id: WorkerId,
        function: &str,
        arity: u32,
    ) -> Result<Vec<Action>> {
        self.registry.register_function(worker_id, function, arity)?;
        let mut actions = Vec::new();
        self.scheduling_pass(&mut actions)?;
        Ok(actions)
    }

    /// Submits a task.
    ///
    /// Allocates `arity` fresh result refs held by the submitter and takes
    /// one hold per `ObjRef` argument occurrence for the task's lifetime.
    /// Unknown functions are reported, not enqueued.
    pub fn submit_task(&mut self, spec: TaskSpec) -> Result<(Vec<ObjRef>, bool, Vec<Action>)> {
        let Some(function) = self.registry.function(&spec.function) else {
            debug!(function = %spec.function, "submit for unknown function");
            return Ok((Vec::new(), false, Vec::new()));
        };
        let arity = function.arity;

        // Validate before mutating: naming a retired ref fails the call.
        for arg in &spec.args {
            if let Arg::Ref(r) = arg {
                self.objects.refcount(*r)?;
            }
        }

        let result_refs: Vec<ObjRef> = (0..arity).map(|_| self.objects.allocate()).collect();

        for arg in &spec.args {
            if let Arg::Ref(r) = arg {
                self.objects.increment(*r, 1)?;
            }
        }

        let operation_id = self
            .tasks
            .enqueue(spec.function.clone(), spec.args, result_refs.clone());
        info!(%operation_id, function = %spec.function, "task submitted");

        let mut actions = Vec::new();
        self.scheduling_pass(&mut actions)?;
        Ok((result_refs, true, actions))
    }

    /// Reserves a fresh ref for an imminent upload by `worker_id`.
    pub fn push_obj(&mut self, worker_id: WorkerId) -> Result<ObjRef> {
        self.registry.worker(worker_id)?;
        Ok(self.objects.allocate())
    }

    /// Ensures the canonical of `objref` is (or becomes) present on the
    /// worker's local store.
    pub fn request_obj(&mut self, worker_id: WorkerId, objref: ObjRef) -> Result<Vec<Action>> {
        let store = self.registry.worker(worker_id)?.objstore;
        let canonical = self.objects.canonical(objref)?;

        let mut actions = Vec::new();

        // The requester will look the object up under the name it holds;
        // make the alias resolvable on its store.
        if objref != canonical {
            let addr = self.registry.objstore(store)?.address.clone();
            actions.push(Action::NotifyAlias {
                store_addr: addr,
                alias: objref,
                canonical,
            });
        }

        if self.objects.is_ready(canonical)? {
            self.ensure_delivery(store, canonical, &mut actions)?;
        } else {
            // Deliveries start once the payload exists somewhere.
            self.wanted.entry(canonical).or_default().insert(store);
        }
        Ok(actions)
    }

    /// Declares `alias` equal to `target`.
    pub fn alias_objrefs(&mut self, alias: ObjRef, target: ObjRef) -> Result<Vec<Action>> {
        let effect = self.objects.alias(alias, target)?;
        if effect.noop {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        for store in &effect.notify_stores {
            let addr = self.registry.objstore(*store)?.address.clone();
            actions.push(Action::NotifyAlias {
                store_addr: addr,
                alias,
                canonical: effect.canonical,
            });
        }

        // The alias inherits readiness; queued tasks naming it may match.
        if effect.ready {
            self.scheduling_pass(&mut actions)?;
        }
        Ok(actions)
    }

    /// Records that `objstore_id` holds the finalized payload for the
    /// canonical of `objref`, unblocking dependents.
    pub fn obj_ready(&mut self, objref: ObjRef, objstore_id: ObjStoreId) -> Result<Vec<Action>> {
        self.registry.objstore(objstore_id)?;
        let (canonical, retired) = self.objects.mark_ready(objref, objstore_id)?;
        debug!(%objref, %canonical, store = %objstore_id, "object ready");

        let mut actions = Vec::new();
        self.push_deallocations(&retired, &mut actions)?;

        // The store now holds the canonical payload; tell it about every
        // name that redirects there so local reads by alias resolve.
        if retired.is_empty() {
            let store_addr = self.registry.objstore(objstore_id)?.address.clone();
            for alias in self.objects.aliases_of(canonical) {
                actions.push(Action::NotifyAlias {
                    store_addr: store_addr.clone(),
                    alias,
                    canonical,
                });
            }
        }

        self.deliveries.remove(&(objstore_id, canonical));

        // Destinations that asked before the payload existed.
        if let Some(stores) = self.wanted.remove(&canonical) {
            for store in stores {
                self.ensure_delivery(store, canonical, &mut actions)?;
            }
        }

        // Parked dispatches whose last missing argument just landed.
        let registry = &self.registry;
        let released = self.tasks.transfer_landed(canonical, |worker| {
            registry
                .worker(worker)
                .is_ok_and(|w| w.objstore == objstore_id)
        });
        for operation_id in released {
            self.dispatch(operation_id, &mut actions)?;
        }

        self.scheduling_pass(&mut actions)?;
        Ok(actions)
    }

    /// Adjusts reference counts; duplicates act per occurrence.
    pub fn increment_refs(&mut self, objrefs: &[ObjRef]) -> Result<()> {
        for r in objrefs {
            self.objects.increment(*r, 1)?;
        }
        Ok(())
    }

    /// Adjusts reference counts downward; a count reaching zero retires
    /// the ref and cascades through contained refs.
    pub fn decrement_refs(&mut self, objrefs: &[ObjRef]) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        for r in objrefs {
            let retired = self.objects.decrement(*r, 1)?;
            self.push_deallocations(&retired, &mut actions)?;
        }
        Ok(actions)
    }

    /// Records the refs embedded inside a produced payload.
    pub fn add_contained(&mut self, objref: ObjRef, contained: Vec<ObjRef>) -> Result<()> {
        self.objects.add_contained(objref, contained)
    }

    /// Marks the previous task finished (if any) and the worker idle.
    pub fn ready_for_new_task(
        &mut self,
        worker_id: WorkerId,
        outcome: Option<TaskOutcome>,
    ) -> Result<Vec<Action>> {
        let mut actions = Vec::new();

        if let Some(outcome) = outcome {
            let assigned = self.tasks.get(outcome.operation_id)?.assigned_worker;
            if assigned != Some(worker_id) {
                return Err(SchedulerError::ProtocolViolation(format!(
                    "operation {} is not assigned to worker {worker_id}",
                    outcome.operation_id
                )));
            }
            let status = if outcome.succeeded {
                TaskStatus::Succeeded
            } else {
                TaskStatus::Failed
            };
            self.finish_task(outcome.operation_id, status, outcome.error_message, &mut actions)?;
        }

        let worker = self.registry.worker_mut(worker_id)?;
        worker.state = WorkerState::Idle;
        worker.current_task = None;

        self.scheduling_pass(&mut actions)?;
        Ok(actions)
    }

    /// Re-entry point for a delivery that failed in transit.
    ///
    /// Retries with a different source while the budget lasts; exhausting
    /// all sources fails every task parked on the transfer.
    pub fn delivery_failed(&mut self, store: ObjStoreId, objref: ObjRef) -> Result<Vec<Action>> {
        let mut actions = Vec::new();

        let Some(delivery) = self.deliveries.get_mut(&(store, objref)) else {
            // Completed concurrently; nothing to do.
            return Ok(actions);
        };

        let locations = self.objects.locations(objref)?;
        let retry_src = locations
            .iter()
            .copied()
            .find(|s| *s != store && !delivery.tried.contains(s));

        if delivery.attempts < self.max_delivery_attempts {
            // Rotate to an untried source when one exists, else re-try the
            // cheapest one.
            let src = retry_src.or_else(|| locations.iter().copied().find(|s| *s != store));
            if let Some(src) = src {
                delivery.attempts += 1;
                delivery.tried.insert(src);
                let src_addr = self.registry.objstore(src)?.address.clone();
                let dst = self.registry.objstore(store)?;
                warn!(%objref, dst = %store, src = %src, "retrying delivery");
                actions.push(Action::StartDelivery {
                    store,
                    store_addr: dst.address.clone(),
                    src_addr,
                    objref,
                });
                return Ok(actions);
            }
        }

        self.deliveries.remove(&(store, objref));
        warn!(%objref, dst = %store, "delivery failed permanently");

        let registry = &self.registry;
        let failed = self.tasks.fail_pending_on(objref, |worker| {
            registry
                .worker(worker)
                .is_ok_and(|w| w.objstore == store)
        });
        for (operation_id, _) in failed {
            let message = format!("transfer of object {objref} failed");
            self.finish_task(operation_id, TaskStatus::Failed, Some(message), &mut actions)?;
        }

        self.scheduling_pass(&mut actions)?;
        Ok(actions)
    }

    /// Re-entry point for an `ExecuteTask` push that could not reach the
    /// worker. The failure is recorded on the task, not masked.
    pub fn dispatch_failed(&mut self, operation_id: OperationId, message: &str) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        self.finish_task(
            operation_id,
            TaskStatus::Failed,
            Some(message.to_owned()),
            &mut actions,
        )?;
        self.scheduling_pass(&mut actions)?;
        Ok(actions)
    }

    /// Read-only snapshot of scheduler state.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            workers: self.registry.worker_snapshots(),
            objstores: self.registry.objstore_snapshots(),
            functions: self.registry.function_snapshots(),
            queued: self.tasks.queued(),
            objects: self.objects.snapshot(),
        }
    }

    /// Read-only snapshot of all task records.
    #[must_use]
    pub fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks.snapshot()
    }

    // ---- internals ----

    /// One scheduling pass over the queue, oldest task first.
    ///
    /// Matching and dispatch are decoupled: a matched task whose arguments
    /// are not all local to the chosen worker's store is parked while the
    /// transfers run, and is not re-matched.
    fn scheduling_pass(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        for operation_id in self.tasks.queued() {
            let (function, args) = {
                let task = self.tasks.get(operation_id)?;
                if task.status != TaskStatus::Queued {
                    continue;
                }
                (task.function.clone(), task.args.clone())
            };

            // An argument marked failed can never materialise; fail the
            // dependent now rather than blocking the queue forever.
            if let Some((r, message)) = self.first_failed_arg(&args)? {
                let message = format!("argument {r} failed: {message}");
                self.finish_task(operation_id, TaskStatus::Failed, Some(message), actions)?;
                continue;
            }

            let idle = self.registry.idle_workers_for(&function);
            if idle.is_empty() {
                continue;
            }

            let Some(arg_canonicals) = self.ready_arg_canonicals(&args)? else {
                continue;
            };

            // Locality tie-break: most argument payloads already local,
            // then lowest worker id for determinism.
            let mut best: Option<(usize, WorkerId)> = None;
            for worker_id in idle {
                let store = self.registry.worker(worker_id)?.objstore;
                let local = arg_canonicals
                    .iter()
                    .filter(|r| {
                        self.objects
                            .locations(**r)
                            .is_ok_and(|locs| locs.contains(&store))
                    })
                    .count();
                if best.is_none_or(|(count, _)| local > count) {
                    best = Some((local, worker_id));
                }
            }
            let Some((_, worker_id)) = best else { continue };
            let store = self.registry.worker(worker_id)?.objstore;

            let mut missing = BTreeSet::new();
            for r in &arg_canonicals {
                if !self.objects.locations(*r)?.contains(&store) {
                    missing.insert(*r);
                }
            }

            self.tasks.unqueue(operation_id);
            {
                let worker = self.registry.worker_mut(worker_id)?;
                worker.state = WorkerState::Busy;
                worker.current_task = Some(operation_id);
            }
            self.tasks.get_mut(operation_id)?.assigned_worker = Some(worker_id);

            if missing.is_empty() {
                self.dispatch(operation_id, actions)?;
            } else {
                debug!(%operation_id, worker = %worker_id, awaiting = missing.len(), "task matched, awaiting transfers");
                for r in &missing {
                    self.ensure_delivery(store, *r, actions)?;
                }
                self.tasks.park(operation_id, worker_id, missing);
            }
        }
        Ok(())
    }

    fn first_failed_arg(&self, args: &[Arg]) -> Result<Option<(ObjRef, String)>> {
        for arg in args {
            if let Arg::Ref(r) = arg {
                if let Some(message) = self.objects.failure(*r)? {
                    // Only refs that can never land in a store block the
                    // queue; store-recorded failures flow to the worker.
                    if self.objects.locations(*r)?.is_empty() && !self.objects.is_ready(*r)? {
                        return Ok(Some((*r, message)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Canonicals of all ref arguments, or `None` if any is not ready.
    fn ready_arg_canonicals(&mut self, args: &[Arg]) -> Result<Option<Vec<ObjRef>>> {
        let mut canonicals = Vec::new();
        for arg in args {
            if let Arg::Ref(r) = arg {
                let canonical = self.objects.canonical(*r)?;
                if !self.objects.is_ready(canonical)? {
                    return Ok(None);
                }
                canonicals.push(canonical);
            }
        }
        Ok(Some(canonicals))
    }

    /// Emits the `ExecuteTask` for a fully-local matched task.
    fn dispatch(&mut self, operation_id: OperationId, actions: &mut Vec<Action>) -> Result<()> {
        let (function, args, result_refs, worker_id) = {
            let task = self.tasks.get(operation_id)?;
            (
                task.function.clone(),
                task.args.clone(),
                task.result_refs.clone(),
                task.assigned_worker.ok_or_else(|| {
                    SchedulerError::ProtocolViolation(format!(
                        "dispatching unassigned operation {operation_id}"
                    ))
                })?,
            )
        };

        // Workers only ever address canonical refs.
        let mut dispatch_args = Vec::with_capacity(args.len());
        for arg in args {
            dispatch_args.push(match arg {
                Arg::Value(v) => Arg::Value(v),
                Arg::Ref(r) => Arg::Ref(self.objects.canonical(r)?),
            });
        }

        self.tasks.get_mut(operation_id)?.status = TaskStatus::Running;
        let worker_addr = self.registry.worker(worker_id)?.address.clone();
        info!(%operation_id, worker = %worker_id, "task dispatched");

        actions.push(Action::Execute {
            worker: worker_id,
            worker_addr,
            dispatch: TaskDispatch {
                operation_id,
                function,
                args: dispatch_args,
                result_refs,
            },
        });
        Ok(())
    }

    /// Starts a delivery of `canonical` to `store` unless the payload is
    /// already there or a transfer is already in flight.
    fn ensure_delivery(
        &mut self,
        store: ObjStoreId,
        canonical: ObjRef,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        let locations = self.objects.locations(canonical)?;
        if locations.contains(&store) {
            return Ok(());
        }
        if self.deliveries.contains_key(&(store, canonical)) {
            return Ok(());
        }

        // Lowest store id for determinism.
        let Some(src) = locations.iter().copied().find(|s| *s != store) else {
            return Ok(());
        };

        let src_addr = self.registry.objstore(src)?.address.clone();
        let store_addr = self.registry.objstore(store)?.address.clone();
        self.deliveries.insert(
            (store, canonical),
            DeliveryState {
                attempts: 1,
                tried: BTreeSet::from([src]),
            },
        );
        debug!(objref = %canonical, src = %src, dst = %store, "starting delivery");
        actions.push(Action::StartDelivery {
            store,
            store_addr,
            src_addr,
            objref: canonical,
        });
        Ok(())
    }

    /// Transitions a task to a terminal status, releasing its holds.
    fn finish_task(
        &mut self,
        operation_id: OperationId,
        status: TaskStatus,
        error_message: Option<String>,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());

        let (args, result_refs, worker, was_terminal) = {
            let task = self.tasks.get_mut(operation_id)?;
            if task.status.is_terminal() {
                (Vec::new(), Vec::new(), None, true)
            } else {
                task.status = status;
                task.error_message = error_message.clone();
                (
                    task.args.clone(),
                    task.result_refs.clone(),
                    task.assigned_worker,
                    false,
                )
            }
        };
        if was_terminal {
            return Ok(());
        }

        self.tasks.unqueue(operation_id);
        self.tasks.unpark(operation_id);

        if status == TaskStatus::Failed {
            let message = error_message.as_deref().unwrap_or("task failed");
            info!(%operation_id, error = message, "task failed");
            for r in &result_refs {
                self.objects.mark_failed(*r, message)?;
            }
        } else {
            info!(%operation_id, "task succeeded");
        }

        // Release the worker if it was reserved and never reported back
        // (transfer failures terminate tasks that were never dispatched).
        if let Some(worker_id) = worker {
            let record = self.registry.worker_mut(worker_id)?;
            if record.current_task == Some(operation_id) {
                record.current_task = None;
                record.state = WorkerState::Idle;
            }
        }

        // The per-task holds on argument refs are released exactly once.
        for arg in &args {
            if let Arg::Ref(r) = arg {
                let retired = self.objects.decrement(*r, 1)?;
                self.push_deallocations(&retired, actions)?;
            }
        }
        Ok(())
    }

    fn push_deallocations(&self, retired: &[Retirement], actions: &mut Vec<Action>) -> Result<()> {
        for retirement in retired {
            for store in &retirement.locations {
                let addr = self.registry.objstore(*store)?.address.clone();
                actions.push(Action::Deallocate {
                    store_addr: addr,
                    objref: retirement.objref,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SchedulerState {
        SchedulerState::new(&DeliveryConfig::default())
    }

    /// Registers a store + worker pair and reports the worker idle.
    fn add_node(state: &mut SchedulerState, store_addr: &str, worker_addr: &str) -> (WorkerId, ObjStoreId) {
        state.register_objstore(store_addr);
        let (worker, store) = state.register_worker(worker_addr, store_addr).unwrap();
        state.ready_for_new_task(worker, None).unwrap();
        (worker, store)
    }

    #[test]
    fn submit_unknown_function_is_not_enqueued() {
        let mut state = state();
        let (refs, registered, actions) = state
            .submit_task(TaskSpec::new("bogus", vec![]))
            .unwrap();
        assert!(refs.is_empty());
        assert!(!registered);
        assert!(actions.is_empty());
        assert!(state.task_snapshots().is_empty());
    }

    #[test]
    fn submit_allocates_distinct_fresh_refs() {
        let mut state = state();
        let (worker, _) = add_node(&mut state, "s1", "w1");
        state.register_function(worker, "pair", 2).unwrap();

        let (refs, registered, _) = state.submit_task(TaskSpec::new("pair", vec![])).unwrap();
        assert!(registered);
        assert_eq!(refs.len(), 2);
        assert_ne!(refs[0], refs[1]);

        let (more, _, _) = state.submit_task(TaskSpec::new("pair", vec![])).unwrap();
        for r in &more {
            assert!(!refs.contains(r));
        }
    }

    #[test]
    fn task_with_local_ready_args_dispatches_immediately() {
        let mut state = state();
        let (worker, store) = add_node(&mut state, "s1", "w1");
        state.register_function(worker, "id", 1).unwrap();

        let input = state.push_obj(worker).unwrap();
        let actions = state.obj_ready(input, store).unwrap();
        assert!(actions.is_empty());

        let (refs, _, actions) = state
            .submit_task(TaskSpec::new("id", vec![Arg::Ref(input)]))
            .unwrap();
        assert_eq!(refs.len(), 1);

        match &actions[..] {
            [Action::Execute { worker: w, dispatch, .. }] => {
                assert_eq!(*w, worker);
                assert_eq!(dispatch.args, vec![Arg::Ref(input)]);
                assert_eq!(dispatch.result_refs, refs);
            }
            other => panic!("expected a single Execute action, got {other:?}"),
        }
    }

    #[test]
    fn task_waits_for_unready_args() {
        let mut state = state();
        let (worker, store) = add_node(&mut state, "s1", "w1");
        state.register_function(worker, "id", 1).unwrap();

        let input = state.push_obj(worker).unwrap();
        let (_, _, actions) = state
            .submit_task(TaskSpec::new("id", vec![Arg::Ref(input)]))
            .unwrap();
        assert!(actions.is_empty(), "must not dispatch before readiness");

        let actions = state.obj_ready(input, store).unwrap();
        assert!(matches!(&actions[..], [Action::Execute { .. }]));
    }

    #[test]
    fn remote_args_trigger_delivery_then_dispatch() {
        let mut state = state();
        // Node 1 has the payload, node 2 has the only eligible worker.
        state.register_objstore("s1");
        let (w2, s2) = add_node(&mut state, "s2", "w2");
        let s1 = state.registry.objstore_by_addr("s1").unwrap();
        state.register_function(w2, "id", 1).unwrap();

        let input = state.objects.allocate();
        state.obj_ready(input, s1).unwrap();

        let (_, _, actions) = state
            .submit_task(TaskSpec::new("id", vec![Arg::Ref(input)]))
            .unwrap();
        match &actions[..] {
            [Action::StartDelivery { store, src_addr, objref, .. }] => {
                assert_eq!(*store, s2);
                assert_eq!(src_addr, "s1");
                assert_eq!(*objref, input);
            }
            other => panic!("expected StartDelivery, got {other:?}"),
        }

        // The transfer lands; the parked task dispatches to w2.
        let actions = state.obj_ready(input, s2).unwrap();
        assert!(matches!(
            &actions[..],
            [Action::Execute { worker, .. }] if *worker == w2
        ));
    }

    #[test]
    fn locality_tie_break_prefers_local_store_then_lowest_id() {
        let mut state = state();
        let (w1, s1) = add_node(&mut state, "s1", "w1");
        let (w2, s2) = add_node(&mut state, "s2", "w2");
        state.register_function(w1, "f", 1).unwrap();
        state.register_function(w2, "f", 1).unwrap();

        let input = state.objects.allocate();
        state.obj_ready(input, s2).unwrap();

        // Payload only on s2: the w2 match avoids a transfer.
        let (_, _, actions) = state
            .submit_task(TaskSpec::new("f", vec![Arg::Ref(input)]))
            .unwrap();
        assert!(matches!(
            &actions[..],
            [Action::Execute { worker, .. }] if *worker == w2
        ));

        // Tie (no ref args): lowest worker id wins. w2 is busy, so free
        // it first by finishing its task.
        let op = state.task_snapshots()[0].operation_id;
        state
            .ready_for_new_task(w2, Some(TaskOutcome::success(op)))
            .unwrap();

        let (_, _, actions) = state.submit_task(TaskSpec::new("f", vec![])).unwrap();
        assert!(matches!(
            &actions[..],
            [Action::Execute { worker, .. }] if *worker == w1
        ));
        let _ = s1;
    }

    #[test]
    fn matched_task_is_not_rematched_while_parked() {
        let mut state = state();
        state.register_objstore("s1");
        let (w2, _) = add_node(&mut state, "s2", "w2");
        let s1 = state.registry.objstore_by_addr("s1").unwrap();
        state.register_function(w2, "id", 1).unwrap();

        let input = state.objects.allocate();
        state.obj_ready(input, s1).unwrap();

        let (_, _, actions) = state
            .submit_task(TaskSpec::new("id", vec![Arg::Ref(input)]))
            .unwrap();
        assert!(matches!(&actions[..], [Action::StartDelivery { .. }]));

        // Another pass (e.g. a later registration) must not re-match the
        // parked task or duplicate its delivery.
        let actions = state.register_function(w2, "id", 1).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn duplicate_deliveries_coalesce() {
        let mut state = state();
        state.register_objstore("s1");
        let (w2, _) = add_node(&mut state, "s2", "w2");
        let s1 = state.registry.objstore_by_addr("s1").unwrap();
        state.register_function(w2, "id", 1).unwrap();

        let input = state.objects.allocate();
        state.obj_ready(input, s1).unwrap();

        let actions = state.request_obj(w2, input).unwrap();
        assert_eq!(actions.len(), 1);

        // Second request while the first is in flight: no new transfer.
        let actions = state.request_obj(w2, input).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn request_obj_before_readiness_is_deferred() {
        let mut state = state();
        state.register_objstore("s1");
        let (w2, s2) = add_node(&mut state, "s2", "w2");
        let s1 = state.registry.objstore_by_addr("s1").unwrap();

        let input = state.objects.allocate();
        let actions = state.request_obj(w2, input).unwrap();
        assert!(actions.is_empty());

        // Payload appears on s1: the deferred want turns into a delivery.
        let actions = state.obj_ready(input, s1).unwrap();
        assert!(matches!(
            &actions[..],
            [Action::StartDelivery { store, .. }] if *store == s2
        ));
    }

    #[test]
    fn delivery_failure_rotates_sources_then_fails_dependents() {
        let mut state = state();
        state.register_objstore("s1");
        state.register_objstore("s2");
        let (w3, s3) = add_node(&mut state, "s3", "w3");
        let s1 = state.registry.objstore_by_addr("s1").unwrap();
        let s2 = state.registry.objstore_by_addr("s2").unwrap();
        state.register_function(w3, "id", 1).unwrap();

        let input = state.objects.allocate();
        state.obj_ready(input, s1).unwrap();
        state.obj_ready(input, s2).unwrap();

        let (refs, _, actions) = state
            .submit_task(TaskSpec::new("id", vec![Arg::Ref(input)]))
            .unwrap();
        assert!(matches!(
            &actions[..],
            [Action::StartDelivery { src_addr, .. }] if src_addr == "s1"
        ));

        // First failure: rotate to the other source.
        let actions = state.delivery_failed(s3, input).unwrap();
        assert!(matches!(
            &actions[..],
            [Action::StartDelivery { src_addr, .. }] if src_addr == "s2"
        ));

        // Exhaust the budget.
        let actions = state.delivery_failed(s3, input).unwrap();
        assert!(matches!(&actions[..], [Action::StartDelivery { .. }]));
        let actions = state.delivery_failed(s3, input).unwrap();
        assert!(actions.is_empty());

        let tasks = state.task_snapshots();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, meridian_proto::TaskStatusProto::Failed);
        assert!(tasks[0].error_message.as_deref().unwrap().contains("transfer"));

        // The result ref is marked failed and the worker is free again.
        assert!(state.objects.failure(refs[0]).unwrap().is_some());
        let snapshot = state.snapshot();
        assert_eq!(
            snapshot.workers[0].state,
            meridian_proto::WorkerStateProto::Idle
        );
    }

    #[test]
    fn failed_task_marks_results_and_releases_holds() {
        let mut state = state();
        let (worker, store) = add_node(&mut state, "s1", "w1");
        state.register_function(worker, "boom", 1).unwrap();

        let input = state.push_obj(worker).unwrap();
        state.obj_ready(input, store).unwrap();
        assert_eq!(state.objects.refcount(input).unwrap(), 1);

        let (refs, _, _) = state
            .submit_task(TaskSpec::new("boom", vec![Arg::Ref(input)]))
            .unwrap();
        // Submitter hold + per-task hold.
        assert_eq!(state.objects.refcount(input).unwrap(), 2);

        let op = state.task_snapshots()[0].operation_id;
        state
            .ready_for_new_task(worker, Some(TaskOutcome::failure(op, "E")))
            .unwrap();

        let tasks = state.task_snapshots();
        assert_eq!(tasks[0].status, meridian_proto::TaskStatusProto::Failed);
        assert_eq!(tasks[0].error_message.as_deref(), Some("E"));
        assert_eq!(state.objects.failure(refs[0]).unwrap().as_deref(), Some("E"));

        // The per-task hold was released.
        assert_eq!(state.objects.refcount(input).unwrap(), 1);
    }

    #[test]
    fn gc_cascade_issues_deallocations() {
        let mut state = state();
        let (worker, store) = add_node(&mut state, "s1", "w1");

        let container = state.push_obj(worker).unwrap();
        let child_a = state.push_obj(worker).unwrap();
        let child_b = state.push_obj(worker).unwrap();
        for r in [container, child_a, child_b] {
            state.obj_ready(r, store).unwrap();
        }
        state
            .add_contained(container, vec![child_a, child_b])
            .unwrap();

        // Submitters drop the children; the container keeps them alive.
        assert!(state.decrement_refs(&[child_a, child_b]).unwrap().is_empty());

        // Dropping the container cascades into both children.
        let actions = state.decrement_refs(&[container]).unwrap();
        let freed: Vec<ObjRef> = actions
            .iter()
            .map(|a| match a {
                Action::Deallocate { objref, .. } => *objref,
                other => panic!("expected Deallocate, got {other:?}"),
            })
            .collect();
        assert_eq!(freed, vec![container, child_a, child_b]);
    }

    #[test]
    fn alias_notifies_holding_stores() {
        let mut state = state();
        let (worker, store) = add_node(&mut state, "s1", "w1");

        let target = state.push_obj(worker).unwrap();
        state.obj_ready(target, store).unwrap();
        let alias = state.push_obj(worker).unwrap();

        let actions = state.alias_objrefs(alias, target).unwrap();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::NotifyAlias { alias: a, canonical: c, .. } if *a == alias && *c == target
        )));

        // Readiness flows through the alias.
        assert!(state.objects.is_ready(alias).unwrap());
    }
}
