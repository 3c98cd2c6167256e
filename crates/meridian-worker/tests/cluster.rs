//! End-to-end cluster tests: a live scheduler, object stores, and worker
//! runtimes wired over loopback TCP, driven through the client API the
//! way an external submitter would.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meridian_net::{NetError, ObjStoreClient, SchedulerClient};
use meridian_objstore::{LocalStore, ObjStoreService};
use meridian_proto::{Arg, ErrorCode, ObjRef, TaskSpec, TaskStatusProto, WorkerId};
use meridian_scheduler::{DeliveryConfig, SchedulerService, SchedulerState};
use meridian_worker::{
    FunctionRegistry, ReturnValue, TaskContext, TaskError, TaskFunction, WorkerConfig,
    WorkerRuntime,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn start_scheduler() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let service = SchedulerService::new(SchedulerState::new(&DeliveryConfig::default()));
    tokio::spawn(service.run(listener, CancellationToken::new()));
    addr
}

async fn start_store(scheduler_addr: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let client = SchedulerClient::new(scheduler_addr);
    let objstore_id = client.register_objstore(&addr).await.unwrap();
    let service = ObjStoreService::new(LocalStore::new(), client, objstore_id);
    tokio::spawn(service.run(listener, CancellationToken::new()));
    addr
}

fn start_worker(scheduler_addr: &str, objstore_addr: &str, registry: FunctionRegistry) {
    let config = WorkerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        advertise_addr: None,
        scheduler_addr: scheduler_addr.to_owned(),
        objstore_addr: objstore_addr.to_owned(),
    };
    let runtime = WorkerRuntime::new(config, registry);
    tokio::spawn(runtime.run(CancellationToken::new()));
}

/// Registers a driver so the test can reserve refs via `PushObj`.
async fn driver_on(scheduler: &SchedulerClient, store_addr: &str) -> WorkerId {
    let (worker_id, _) = scheduler
        .register_worker("127.0.0.1:1", store_addr)
        .await
        .unwrap();
    worker_id
}

fn echo_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register_fn("echo", 1, |_, args| {
        Ok(vec![ReturnValue::payload(args[0].to_vec(), 0)])
    });
    registry
}

async fn wait_for_function(scheduler: &SchedulerClient, name: &str) {
    for _ in 0..100 {
        let snapshot = scheduler.scheduler_info().await.unwrap();
        if snapshot.functions.iter().any(|f| f.name == name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("function {name} never registered");
}

async fn wait_for_terminal(scheduler: &SchedulerClient, result_ref: ObjRef) -> TaskStatusProto {
    for _ in 0..250 {
        let tasks = scheduler.task_info().await.unwrap();
        if let Some(task) = tasks.iter().find(|t| t.result_refs.contains(&result_ref)) {
            match task.status {
                TaskStatusProto::Succeeded | TaskStatusProto::Failed => return task.status,
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task for {result_ref} never finished");
}

#[tokio::test]
async fn single_node_identity_task() {
    let scheduler_addr = start_scheduler().await;
    let store_addr = start_store(&scheduler_addr).await;
    start_worker(&scheduler_addr, &store_addr, echo_registry());

    let scheduler = SchedulerClient::new(&scheduler_addr);
    let store = ObjStoreClient::new(&store_addr);
    wait_for_function(&scheduler, "echo").await;

    let driver = driver_on(&scheduler, &store_addr).await;
    let input = scheduler.push_obj(driver).await.unwrap();
    store.put_obj(input, 0, &[0xAB]).await.unwrap();

    let (results, registered) = scheduler
        .submit_task(TaskSpec::new("echo", vec![Arg::Ref(input)]))
        .await
        .unwrap();
    assert!(registered);
    assert_eq!(results.len(), 1);

    let status = wait_for_terminal(&scheduler, results[0]).await;
    assert_eq!(status, TaskStatusProto::Succeeded);

    let (data, _) = store.get_obj(results[0]).await.unwrap();
    assert_eq!(&data[..], &[0xAB]);
}

#[tokio::test]
async fn cross_node_input_is_transferred_before_execution() {
    let scheduler_addr = start_scheduler().await;
    let store1_addr = start_store(&scheduler_addr).await;
    let store2_addr = start_store(&scheduler_addr).await;
    // The only worker that knows `echo` lives on node 2.
    start_worker(&scheduler_addr, &store2_addr, echo_registry());

    let scheduler = SchedulerClient::new(&scheduler_addr);
    let store1 = ObjStoreClient::new(&store1_addr);
    let store2 = ObjStoreClient::new(&store2_addr);
    wait_for_function(&scheduler, "echo").await;

    let driver = driver_on(&scheduler, &store1_addr).await;
    let payload: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
    let input = scheduler.push_obj(driver).await.unwrap();
    store1.put_obj(input, 0, &payload).await.unwrap();

    let (results, _) = scheduler
        .submit_task(TaskSpec::new("echo", vec![Arg::Ref(input)]))
        .await
        .unwrap();
    let status = wait_for_terminal(&scheduler, results[0]).await;
    assert_eq!(status, TaskStatusProto::Succeeded);

    // The input was pulled to node 2 for execution, and the result lives
    // there too.
    let info = store2.objstore_info(vec![input]).await.unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].total_size, payload.len() as u64);

    let (data, _) = store2.get_obj(results[0]).await.unwrap();
    assert_eq!(&data[..], &payload[..]);
}

struct Inner;

#[async_trait]
impl TaskFunction for Inner {
    async fn invoke(
        &self,
        _ctx: &TaskContext,
        _args: Vec<Bytes>,
    ) -> Result<Vec<ReturnValue>, TaskError> {
        Ok(vec![ReturnValue::payload(b"xyz".to_vec(), 0)])
    }
}

struct Outer;

#[async_trait]
impl TaskFunction for Outer {
    async fn invoke(
        &self,
        ctx: &TaskContext,
        _args: Vec<Bytes>,
    ) -> Result<Vec<ReturnValue>, TaskError> {
        // The result of this task IS the result of the nested task: the
        // runtime aliases the outer result ref to the inner one.
        let refs = ctx.submit("inner", vec![]).await?;
        Ok(vec![ReturnValue::ObjRef(refs[0])])
    }
}

#[tokio::test]
async fn nested_task_result_aliases_through() {
    let scheduler_addr = start_scheduler().await;
    let store_addr = start_store(&scheduler_addr).await;

    let mut registry = FunctionRegistry::new();
    registry.register("inner", 1, std::sync::Arc::new(Inner));
    registry.register("outer", 1, std::sync::Arc::new(Outer));
    start_worker(&scheduler_addr, &store_addr, registry);

    let scheduler = SchedulerClient::new(&scheduler_addr);
    let store = ObjStoreClient::new(&store_addr);
    wait_for_function(&scheduler, "outer").await;

    let (results, _) = scheduler
        .submit_task(TaskSpec::new("outer", vec![]))
        .await
        .unwrap();

    // Reading through the alias blocks until the inner task's payload
    // lands and the alias is installed, then resolves to the same bytes.
    let (data, _) = store.get_obj(results[0]).await.unwrap();
    assert_eq!(&data[..], b"xyz");

    // Scheduler-side, the outer result redirects to the inner result.
    let snapshot = scheduler.scheduler_info().await.unwrap();
    let record = snapshot
        .objects
        .iter()
        .find(|o| o.objref == results[0])
        .unwrap();
    assert_ne!(record.canonical, results[0]);
}

#[tokio::test]
async fn failed_task_reports_error_to_readers() {
    let scheduler_addr = start_scheduler().await;
    let store_addr = start_store(&scheduler_addr).await;

    let mut registry = FunctionRegistry::new();
    registry.register_fn("boom", 1, |_, _| {
        Err(TaskError::msg("intentionally failed"))
    });
    start_worker(&scheduler_addr, &store_addr, registry);

    let scheduler = SchedulerClient::new(&scheduler_addr);
    let store = ObjStoreClient::new(&store_addr);
    wait_for_function(&scheduler, "boom").await;

    let (results, _) = scheduler
        .submit_task(TaskSpec::new("boom", vec![]))
        .await
        .unwrap();

    let status = wait_for_terminal(&scheduler, results[0]).await;
    assert_eq!(status, TaskStatusProto::Failed);

    let tasks = scheduler.task_info().await.unwrap();
    let task = tasks
        .iter()
        .find(|t| t.result_refs.contains(&results[0]))
        .unwrap();
    assert!(task
        .error_message
        .as_deref()
        .unwrap()
        .contains("intentionally failed"));

    // Readers of the result ref fail with the captured message.
    let err = store.get_obj(results[0]).await.unwrap_err();
    match err {
        NetError::Remote { code, message } => {
            assert_eq!(code, ErrorCode::TaskFailure);
            assert!(message.contains("intentionally failed"));
        }
        other => panic!("expected task failure, got {other}"),
    }
}

#[tokio::test]
async fn unknown_function_is_rejected_without_refs() {
    let scheduler_addr = start_scheduler().await;
    let store_addr = start_store(&scheduler_addr).await;
    start_worker(&scheduler_addr, &store_addr, echo_registry());

    let scheduler = SchedulerClient::new(&scheduler_addr);
    let (results, registered) = scheduler
        .submit_task(TaskSpec::new("bogus", vec![]))
        .await
        .unwrap();
    assert!(results.is_empty());
    assert!(!registered);
    let _ = store_addr;
}

#[tokio::test]
async fn multi_value_results_land_separately() {
    let scheduler_addr = start_scheduler().await;
    let store_addr = start_store(&scheduler_addr).await;

    let mut registry = FunctionRegistry::new();
    registry.register_fn("split", 2, |_, args: Vec<Bytes>| {
        let data = &args[0];
        let mid = data.len() / 2;
        Ok(vec![
            ReturnValue::payload(data[..mid].to_vec(), 0),
            ReturnValue::payload(data[mid..].to_vec(), 0),
        ])
    });
    start_worker(&scheduler_addr, &store_addr, registry);

    let scheduler = SchedulerClient::new(&scheduler_addr);
    let store = ObjStoreClient::new(&store_addr);
    wait_for_function(&scheduler, "split").await;

    let driver = driver_on(&scheduler, &store_addr).await;
    let input = scheduler.push_obj(driver).await.unwrap();
    store.put_obj(input, 0, b"headtail").await.unwrap();

    let (results, _) = scheduler
        .submit_task(TaskSpec::new("split", vec![Arg::Ref(input)]))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);

    let status = wait_for_terminal(&scheduler, results[0]).await;
    assert_eq!(status, TaskStatusProto::Succeeded);

    let (head, _) = store.get_obj(results[0]).await.unwrap();
    let (tail, _) = store.get_obj(results[1]).await.unwrap();
    assert_eq!(&head[..], b"head");
    assert_eq!(&tail[..], b"tail");
}
