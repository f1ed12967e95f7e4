//! Full-stack tests: a real broker, a real worker, and the client all
//! talking over loopback TCP.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

use asyncq_broker::{Broker, BrokerConfig};
use asyncq_client::{Client, SendOptions};
use asyncq_core::{ResultMeta, RetryPolicy, TaskState};
use asyncq_worker::tasks::EchoTask;
use asyncq_worker::{HandlerError, TaskContext, TaskHandler, TaskOptions, Worker, WorkerConfig};

async fn start_broker() -> (Arc<Broker>, String) {
    let broker = Broker::new(BrokerConfig {
        port: 0,
        ..Default::default()
    })
    .unwrap();
    let addr = broker.bind().await.unwrap();
    tokio::spawn(broker.clone().run());
    (broker, addr.to_string())
}

fn worker_config(broker_addr: &str, concurrency: u16) -> WorkerConfig {
    WorkerConfig {
        broker_addr: broker_addr.to_string(),
        result_backend_addr: Some(broker_addr.to_string()),
        concurrency,
        reconnect_initial_ms: 50,
        reconnect_max_ms: 200,
        shutdown_grace_secs: 2,
        ..Default::default()
    }
}

/// Poll with fresh result handles until the record reaches `target`.
async fn wait_for_state(
    client: &Client,
    task_id: Uuid,
    target: TaskState,
    timeout: Duration,
) -> ResultMeta {
    let deadline = Instant::now() + timeout;
    loop {
        let meta = client.result_for(task_id).unwrap().meta().await.unwrap();
        if meta.status == target {
            return meta;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {target}, last saw {}",
            meta.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Records how many times it ran and which argument it saw, then
/// succeeds.
struct CountingEcho {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler for CountingEcho {
    async fn run(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ctx.args.first().cloned().unwrap_or(Value::Null))
    }
}

/// Always fails with the same message.
struct CountingFail {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler for CountingFail {
    async fn run(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::failed("synthetic failure"))
    }
}

/// Fails until the third attempt, then succeeds.
struct FlakyTask {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler for FlakyTask {
    async fn run(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < 3 {
            Err(HandlerError::failed(format!("attempt {attempt} flaked")))
        } else {
            Ok(json!("finally"))
        }
    }
}

/// Sleeps long enough to never finish within a test, flagging when it
/// starts.
struct NeverDone {
    started: Arc<AtomicBool>,
}

#[async_trait]
impl TaskHandler for NeverDone {
    async fn run(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(Value::Null)
    }
}

/// Sleeps a fixed time while tracking how many copies run at once.
struct GaugedSleep {
    sleep: Duration,
    running: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler for GaugedSleep {
    async fn run(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.sleep).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

/// Appends its first argument to a shared log, serialized by the
/// worker's concurrency setting.
struct Recorder {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TaskHandler for Recorder {
    async fn run(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        let label = ctx.args.first().and_then(Value::as_str).unwrap_or("?");
        self.order.lock().push(label.to_string());
        Ok(Value::Null)
    }
}

/// Publishes STARTED progress, works briefly, then returns.
struct ProgressTask;

#[async_trait]
impl TaskHandler for ProgressTask {
    async fn run(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        ctx.update_state(TaskState::Started, json!({ "progress": 0.4 }))
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(json!("done"))
    }
}

struct PanickingTask;

#[async_trait]
impl TaskHandler for PanickingTask {
    async fn run(&self, _ctx: TaskContext) -> Result<Value, HandlerError> {
        panic!("synthetic panic");
    }
}

fn no_retry() -> TaskOptions {
    TaskOptions {
        max_retries: 0,
        ..Default::default()
    }
}

fn fast_retry(max_retries: u32) -> TaskOptions {
    TaskOptions {
        max_retries,
        retry_policy: RetryPolicy::Fixed {
            delay: Duration::from_millis(100),
        },
        ignore_result: false,
    }
}

#[tokio::test]
async fn test_task_runs_to_success() {
    let (_broker, addr) = start_broker().await;
    let worker = Worker::new(worker_config(&addr, 8)).unwrap();
    worker.register("demo.echo", TaskOptions::default(), Arc::new(EchoTask));
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let mut kwargs = Map::new();
    kwargs.insert("k".to_string(), json!("v"));
    let result = client
        .send_task(
            "demo.echo",
            vec![json!(1), json!("two")],
            kwargs,
            SendOptions::default(),
        )
        .await
        .unwrap();

    let value = result
        .get_with_interval(Some(Duration::from_secs(10)), Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(value, json!({ "args": [1, "two"], "kwargs": { "k": "v" } }));

    let meta = wait_for_state(
        &client,
        result.task_id(),
        TaskState::Success,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(meta.task_id, Some(result.task_id()));
    assert!(meta.date_done.is_some());
}

#[tokio::test]
async fn test_concurrency_ceiling_bounds_parallelism() {
    let (_broker, addr) = start_broker().await;
    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let worker = Worker::new(worker_config(&addr, 2)).unwrap();
    worker.register(
        "t.sleep",
        TaskOptions::default(),
        Arc::new(GaugedSleep {
            sleep: Duration::from_millis(500),
            running: Arc::clone(&running),
            peak: Arc::clone(&peak),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(
            client
                .send_task("t.sleep", Vec::new(), Map::new(), SendOptions::default())
                .await
                .unwrap(),
        );
    }
    for handle in &handles {
        handle
            .get_with_interval(Some(Duration::from_secs(10)), Duration::from_millis(50))
            .await
            .unwrap();
    }
    let elapsed = started.elapsed();

    // Four 500 ms sleeps through a ceiling of two: two batches.
    assert!(peak.load(Ordering::SeqCst) <= 2, "ceiling exceeded");
    assert!(elapsed >= Duration::from_millis(990), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1900), "{elapsed:?}");
}

#[tokio::test]
async fn test_failure_with_no_retries_runs_once() {
    let (_broker, addr) = start_broker().await;
    let calls = Arc::new(AtomicU32::new(0));

    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register(
        "t.fail",
        no_retry(),
        Arc::new(CountingFail {
            calls: Arc::clone(&calls),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task("t.fail", Vec::new(), Map::new(), SendOptions::default())
        .await
        .unwrap();

    // With max_retries=0 no RETRY record is ever written, so the first
    // non-PENDING state any poll observes must already be FAILURE.
    result
        .get_with_interval(Some(Duration::from_secs(10)), Duration::from_millis(50))
        .await
        .unwrap();
    let observed = result.meta().await.unwrap();
    assert_eq!(observed.status, TaskState::Failure);
    let description = observed.result.as_str().unwrap();
    assert!(description.contains("synthetic failure"), "{description}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_until_success() {
    let (_broker, addr) = start_broker().await;
    let calls = Arc::new(AtomicU32::new(0));

    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register(
        "t.flaky",
        fast_retry(3),
        Arc::new(FlakyTask {
            calls: Arc::clone(&calls),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task("t.flaky", Vec::new(), Map::new(), SendOptions::default())
        .await
        .unwrap();

    let meta = wait_for_state(
        &client,
        result.task_id(),
        TaskState::Success,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(meta.result, json!("finally"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retries_exhausted_is_failure() {
    let (_broker, addr) = start_broker().await;
    let calls = Arc::new(AtomicU32::new(0));

    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register(
        "t.fail",
        fast_retry(2),
        Arc::new(CountingFail {
            calls: Arc::clone(&calls),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task("t.fail", Vec::new(), Map::new(), SendOptions::default())
        .await
        .unwrap();

    wait_for_state(
        &client,
        result.task_id(),
        TaskState::Failure,
        Duration::from_secs(10),
    )
    .await;
    // Initial attempt plus two retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_revoke_before_delivery_skips_handler() {
    let (_broker, addr) = start_broker().await;
    let calls = Arc::new(AtomicU32::new(0));

    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register(
        "t.echo",
        TaskOptions::default(),
        Arc::new(CountingEcho {
            calls: Arc::clone(&calls),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let task_id = Uuid::new_v4();
    client
        .send_task(
            "t.echo",
            vec![json!("never run")],
            Map::new(),
            SendOptions::default()
                .task_id(task_id)
                .countdown(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    client.revoke(task_id).await.unwrap();

    let meta = wait_for_state(&client, task_id, TaskState::Revoked, Duration::from_secs(10)).await;
    assert_eq!(meta.status, TaskState::Revoked);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_revoke_cancels_running_task() {
    let (_broker, addr) = start_broker().await;
    let started = Arc::new(AtomicBool::new(false));

    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register(
        "t.forever",
        TaskOptions::default(),
        Arc::new(NeverDone {
            started: Arc::clone(&started),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task("t.forever", Vec::new(), Map::new(), SendOptions::default())
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "task never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.revoke(result.task_id()).await.unwrap();
    wait_for_state(
        &client,
        result.task_id(),
        TaskState::Revoked,
        Duration::from_secs(10),
    )
    .await;
}

#[tokio::test]
async fn test_get_times_out_while_task_never_finishes() {
    let (_broker, addr) = start_broker().await;
    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register(
        "t.forever",
        TaskOptions::default(),
        Arc::new(NeverDone {
            started: Arc::new(AtomicBool::new(false)),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task("t.forever", Vec::new(), Map::new(), SendOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let error = result
        .get_with_interval(Some(Duration::from_secs(1)), Duration::from_millis(500))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(error.to_string(), "the operation timed out");
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
}

#[tokio::test]
async fn test_expired_task_never_runs() {
    let (_broker, addr) = start_broker().await;
    let calls = Arc::new(AtomicU32::new(0));

    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register(
        "t.echo",
        TaskOptions::default(),
        Arc::new(CountingEcho {
            calls: Arc::clone(&calls),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task(
            "t.echo",
            vec![json!("stale")],
            Map::new(),
            SendOptions::default().expires(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();

    wait_for_state(
        &client,
        result.task_id(),
        TaskState::Revoked,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_countdown_delays_execution() {
    let (_broker, addr) = start_broker().await;
    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register("demo.echo", TaskOptions::default(), Arc::new(EchoTask));
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let started = Instant::now();
    let result = client
        .send_task(
            "demo.echo",
            Vec::new(),
            Map::new(),
            SendOptions::default().countdown(Duration::from_millis(700)),
        )
        .await
        .unwrap();

    result
        .get_with_interval(Some(Duration::from_secs(10)), Duration::from_millis(50))
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
}

#[tokio::test]
async fn test_priority_orders_backlog() {
    let (_broker, addr) = start_broker().await;
    let order = Arc::new(Mutex::new(Vec::new()));

    // Build the backlog before any consumer exists.
    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let mut ids = Vec::new();
    for (label, priority) in [("low-a", 0), ("low-b", 0), ("high-c", 9)] {
        let result = client
            .send_task(
                "t.record",
                vec![json!(label)],
                Map::new(),
                SendOptions::default().priority(priority),
            )
            .await
            .unwrap();
        ids.push(result.task_id());
    }

    let worker = Worker::new(worker_config(&addr, 1)).unwrap();
    worker.register(
        "t.record",
        TaskOptions::default(),
        Arc::new(Recorder {
            order: Arc::clone(&order),
        }),
    );
    tokio::spawn(worker.run());

    for task_id in ids {
        wait_for_state(&client, task_id, TaskState::Success, Duration::from_secs(10)).await;
    }
    let seen = order.lock().clone();
    assert_eq!(seen, vec!["high-c", "low-a", "low-b"]);
}

#[tokio::test]
async fn test_ignore_result_leaves_record_pending() {
    let (_broker, addr) = start_broker().await;
    let calls = Arc::new(AtomicU32::new(0));

    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register(
        "t.echo",
        TaskOptions::default(),
        Arc::new(CountingEcho {
            calls: Arc::clone(&calls),
        }),
    );
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task(
            "t.echo",
            vec![json!("quiet")],
            Map::new(),
            SendOptions::default().ignore_result(),
        )
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while calls.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "task never ran");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Give the settlement a moment, then confirm nothing was written.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let state = client
        .result_for(result.task_id())
        .unwrap()
        .state()
        .await
        .unwrap();
    assert_eq!(state, TaskState::Pending);
}

#[tokio::test]
async fn test_unknown_task_records_failure() {
    let (_broker, addr) = start_broker().await;
    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register("demo.echo", TaskOptions::default(), Arc::new(EchoTask));
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task("no.such.task", Vec::new(), Map::new(), SendOptions::default())
        .await
        .unwrap();

    let meta = wait_for_state(
        &client,
        result.task_id(),
        TaskState::Failure,
        Duration::from_secs(10),
    )
    .await;
    let description = meta.result.as_str().unwrap();
    assert!(description.contains("not registered"), "{description}");
}

#[tokio::test]
async fn test_update_state_publishes_progress() {
    let (_broker, addr) = start_broker().await;
    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register("t.progress", TaskOptions::default(), Arc::new(ProgressTask));
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task("t.progress", Vec::new(), Map::new(), SendOptions::default())
        .await
        .unwrap();

    let meta = wait_for_state(
        &client,
        result.task_id(),
        TaskState::Started,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(meta.result, json!({ "progress": 0.4 }));

    let meta = wait_for_state(
        &client,
        result.task_id(),
        TaskState::Success,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(meta.result, json!("done"));
}

#[tokio::test]
async fn test_panicking_handler_records_failure() {
    let (_broker, addr) = start_broker().await;
    let worker = Worker::new(worker_config(&addr, 4)).unwrap();
    worker.register("t.panic", no_retry(), Arc::new(PanickingTask));
    tokio::spawn(worker.run());

    let client = Client::connect_with_backend(&addr, &addr).await.unwrap();
    let result = client
        .send_task("t.panic", Vec::new(), Map::new(), SendOptions::default())
        .await
        .unwrap();

    let meta = wait_for_state(
        &client,
        result.task_id(),
        TaskState::Failure,
        Duration::from_secs(10),
    )
    .await;
    let description = meta.result.as_str().unwrap();
    assert!(description.contains("panicked"), "{description}");
}

#[tokio::test]
async fn test_oversized_concurrency_is_rejected() {
    let config = WorkerConfig {
        concurrency: 0,
        ..Default::default()
    };
    let error = Worker::new(config).unwrap_err();
    assert!(error.to_string().contains("between 1 and 65535"), "{error}");
}
