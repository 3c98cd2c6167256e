//! HTTP introspection API for the scheduler.
//!
//! Read-only: the wire service is the sole mutation path. Mirrors the
//! `SchedulerInfo` / `TaskInfo` RPCs for humans and dashboards.

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use meridian_proto::{TaskStatusProto, WorkerStateProto};

use crate::state::SchedulerState;

/// Shared application state.
pub struct AppState {
    pub state: Arc<Mutex<SchedulerState>>,
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/workers", get(list_workers))
        .route("/objstores", get(list_objstores))
        .route("/tasks", get(list_tasks))
        .route("/objects", get(list_objects))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// List all workers.
async fn list_workers(State(app): State<Arc<AppState>>) -> Json<Vec<WorkerResponse>> {
    let state = app.state.lock().await;
    Json(
        state
            .snapshot()
            .workers
            .into_iter()
            .map(|w| WorkerResponse {
                worker_id: w.worker_id.get(),
                address: w.address,
                objstore_id: w.objstore_id.get(),
                state: state_name(w.state),
                current_task: w.current_task.map(|op| op.get()),
            })
            .collect(),
    )
}

/// List all object stores.
async fn list_objstores(State(app): State<Arc<AppState>>) -> Json<Vec<ObjStoreResponse>> {
    let state = app.state.lock().await;
    Json(
        state
            .snapshot()
            .objstores
            .into_iter()
            .map(|(id, address)| ObjStoreResponse {
                objstore_id: id.get(),
                address,
            })
            .collect(),
    )
}

/// List all task records.
async fn list_tasks(State(app): State<Arc<AppState>>) -> Json<Vec<TaskResponse>> {
    let state = app.state.lock().await;
    Json(
        state
            .task_snapshots()
            .into_iter()
            .map(|t| TaskResponse {
                operation_id: t.operation_id.get(),
                function: t.function,
                status: status_name(t.status),
                assigned_worker: t.assigned_worker.map(|w| w.get()),
                result_refs: t.result_refs.iter().map(|r| r.get()).collect(),
                error_message: t.error_message,
            })
            .collect(),
    )
}

/// List all object reference records.
async fn list_objects(State(app): State<Arc<AppState>>) -> Json<Vec<ObjectResponse>> {
    let state = app.state.lock().await;
    Json(
        state
            .snapshot()
            .objects
            .into_iter()
            .map(|o| ObjectResponse {
                objref: o.objref.get(),
                canonical: o.canonical.get(),
                refcount: o.refcount,
                ready: o.ready,
                retired: o.retired,
                locations: o.locations.iter().map(|s| s.get()).collect(),
            })
            .collect(),
    )
}

/// Metrics endpoint in Prometheus text format.
async fn metrics(State(app): State<Arc<AppState>>) -> String {
    let state = app.state.lock().await;
    let snapshot = state.snapshot();
    let tasks = state.task_snapshots();
    drop(state);

    let idle = snapshot
        .workers
        .iter()
        .filter(|w| w.state == WorkerStateProto::Idle)
        .count();
    let running = tasks
        .iter()
        .filter(|t| t.status == TaskStatusProto::Running)
        .count();
    let failed = tasks
        .iter()
        .filter(|t| t.status == TaskStatusProto::Failed)
        .count();
    let live_objects = snapshot.objects.iter().filter(|o| !o.retired).count();

    format!(
        "# HELP scheduler_workers_total Total number of registered workers\n\
         # TYPE scheduler_workers_total gauge\n\
         scheduler_workers_total {}\n\n\
         # HELP scheduler_workers_idle Number of idle workers\n\
         # TYPE scheduler_workers_idle gauge\n\
         scheduler_workers_idle {}\n\n\
         # HELP scheduler_objstores_total Registered object stores\n\
         # TYPE scheduler_objstores_total gauge\n\
         scheduler_objstores_total {}\n\n\
         # HELP scheduler_tasks_queued Queued tasks\n\
         # TYPE scheduler_tasks_queued gauge\n\
         scheduler_tasks_queued {}\n\n\
         # HELP scheduler_tasks_running Running tasks\n\
         # TYPE scheduler_tasks_running gauge\n\
         scheduler_tasks_running {}\n\n\
         # HELP scheduler_tasks_failed Failed tasks\n\
         # TYPE scheduler_tasks_failed counter\n\
         scheduler_tasks_failed {}\n\n\
         # HELP scheduler_objects_live Live object references\n\
         # TYPE scheduler_objects_live gauge\n\
         scheduler_objects_live {}\n",
        snapshot.workers.len(),
        idle,
        snapshot.objstores.len(),
        snapshot.queued.len(),
        running,
        failed,
        live_objects,
    )
}

const fn state_name(state: WorkerStateProto) -> &'static str {
    match state {
        WorkerStateProto::Registering => "registering",
        WorkerStateProto::Idle => "idle",
        WorkerStateProto::Busy => "busy",
    }
}

const fn status_name(status: TaskStatusProto) -> &'static str {
    match status {
        TaskStatusProto::Queued => "queued",
        TaskStatusProto::Running => "running",
        TaskStatusProto::Succeeded => "succeeded",
        TaskStatusProto::Failed => "failed",
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct WorkerResponse {
    worker_id: u64,
    address: String,
    objstore_id: u64,
    state: &'static str,
    current_task: Option<u64>,
}

#[derive(Serialize)]
struct ObjStoreResponse {
    objstore_id: u64,
    address: String,
}

#[derive(Serialize)]
struct TaskResponse {
    operation_id: u64,
    function: String,
    status: &'static str,
    assigned_worker: Option<u64>,
    result_refs: Vec<u64>,
    error_message: Option<String>,
}

#[derive(Serialize)]
struct ObjectResponse {
    objref: u64,
    canonical: u64,
    refcount: u64,
    ready: bool,
    retired: bool,
    locations: Vec<u64>,
}
