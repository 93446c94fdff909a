//! End-to-end engine tests over the in-memory store.
//!
//! Exercises the durable-execution properties of the engine: idempotent step
//! caching, exclusive replay, retry bounds, branch fidelity, error routing,
//! and suspend/resume on missing RPCs -- in both fully in-process and
//! simulated queue-distributed modes. The queue/scheduler fakes record what
//! the engine hands them; a small pump plays the role of the wiring layer by
//! re-delivering recorded work items.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;
use windlass_core::config::EngineConfig;
use windlass_core::engine::WorkflowEngine;
use windlass_core::error::EngineError;
use windlass_core::graph::graph_hash;
use windlass_core::services::{
    EnqueueOptions, QueueError, QueueService, RpcError, RpcService, RpcWire, SchedulerService,
};
use windlass_core::store::WorkflowStore;
use windlass_infra::MemoryStore;
use windlass_types::graph::WorkflowGraph;
use windlass_types::run::{RunStatus, WorkflowRun};
use windlass_types::step::{StepOptions, StepStatus};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// One scripted outcome for an RPC invocation.
enum Behavior {
    Succeed(Value),
    /// Succeed and record a branch key through the wire.
    SucceedWithBranch(Value, &'static str),
    /// Succeed and write one run-state key through the wire.
    SucceedSettingState(Value, &'static str, Value),
    /// Succeed, returning `{"seen": <state value>}` read through the wire.
    SucceedEchoingState(&'static str),
    Fail(&'static str),
    NotFound,
}

/// Scripted RPC collaborator: per-rpc outcome queues plus invocation log.
#[derive(Default)]
struct ScriptedRpc {
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedRpc {
    fn new() -> Self {
        Self::default()
    }

    fn script(self, rpc: &str, behaviors: Vec<Behavior>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(rpc.to_string(), behaviors.into());
        self
    }

    fn call_count(&self, rpc: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == rpc)
            .count()
    }

    fn calls_for(&self, rpc: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == rpc)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl RpcService for ScriptedRpc {
    async fn call(
        &self,
        rpc_name: &str,
        payload: Value,
        wire: RpcWire,
    ) -> Result<Value, RpcError> {
        self.calls
            .lock()
            .unwrap()
            .push((rpc_name.to_string(), payload));

        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(rpc_name)
            .and_then(VecDeque::pop_front);

        match behavior {
            Some(Behavior::Succeed(value)) => Ok(value),
            Some(Behavior::SucceedWithBranch(value, branch)) => {
                wire.branch(branch);
                Ok(value)
            }
            Some(Behavior::SucceedSettingState(value, key, state)) => {
                wire.set_state(key, state);
                Ok(value)
            }
            Some(Behavior::SucceedEchoingState(key)) => {
                Ok(json!({ "seen": wire.get_state(key) }))
            }
            Some(Behavior::Fail(message)) => Err(RpcError::failed(message)),
            Some(Behavior::NotFound) => Err(RpcError::NotFound(rpc_name.to_string())),
            None => Err(RpcError::failed(format!("unscripted rpc '{rpc_name}'"))),
        }
    }
}

/// RPC fake that tracks concurrent invocations of the workflow body.
#[derive(Default)]
struct ConcurrencyProbe {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl RpcService for ConcurrencyProbe {
    async fn call(&self, _rpc: &str, _payload: Value, _wire: RpcWire) -> Result<Value, RpcError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "probed": true }))
    }
}

/// Recorded queue work item.
#[derive(Clone)]
struct QueueItem {
    queue: String,
    payload: Value,
    attempts: u32,
}

/// Queue fake that records every enqueued work item.
#[derive(Default)]
struct RecordingQueue {
    items: Mutex<Vec<QueueItem>>,
}

impl RecordingQueue {
    fn drain(&self) -> Vec<QueueItem> {
        std::mem::take(&mut *self.items.lock().unwrap())
    }
}

impl QueueService for RecordingQueue {
    fn enqueue<'a>(
        &'a self,
        queue: &'a str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        self.items.lock().unwrap().push(QueueItem {
            queue: queue.to_string(),
            payload,
            attempts: options.attempts,
        });
        Box::pin(async { Ok(()) })
    }
}

/// Scheduler fake that records requested callbacks.
#[derive(Default)]
struct RecordingScheduler {
    scheduled: Mutex<Vec<(Duration, String, Value)>>,
}

impl SchedulerService for RecordingScheduler {
    fn schedule_rpc<'a>(
        &'a self,
        delay: Duration,
        rpc_name: &'a str,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>> {
        self.scheduled
            .lock()
            .unwrap()
            .push((delay, rpc_name.to_string(), payload));
        Box::pin(async { Ok(()) })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Opt-in log output while debugging: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn inline_engine(rpc: ScriptedRpc) -> WorkflowEngine<MemoryStore, ScriptedRpc> {
    WorkflowEngine::new(MemoryStore::new(), rpc, EngineConfig::default())
}

fn fast_options(retries: u32) -> StepOptions {
    StepOptions {
        retries: Some(retries),
        retry_delay: Some(Duration::from_millis(1)),
        backoff: None,
    }
}

fn graph(value: Value) -> WorkflowGraph {
    serde_json::from_value(value).unwrap()
}

fn run_id_of(payload: &Value) -> Uuid {
    payload["runId"].as_str().unwrap().parse().unwrap()
}

/// Play the wiring layer: re-deliver recorded work items until the queue
/// stays empty.
async fn pump(
    engine: &WorkflowEngine<MemoryStore, ScriptedRpc>,
    queue: &RecordingQueue,
    graph: Option<&WorkflowGraph>,
) {
    loop {
        let items = queue.drain();
        if items.is_empty() {
            return;
        }
        for item in items {
            let payload = item.payload;
            let run_id = run_id_of(&payload);
            match payload["kind"].as_str().unwrap() {
                "workflow" => {
                    let _ = engine.orchestrate_workflow(run_id).await;
                }
                "workflow_step" => {
                    let _ = engine
                        .execute_workflow_step(
                            run_id,
                            payload["stepName"].as_str().unwrap(),
                            payload["rpcName"].as_str().unwrap(),
                            payload["input"].clone(),
                        )
                        .await;
                }
                "graph" => {
                    let _ = engine
                        .continue_graph(run_id, graph.expect("graph item needs a graph"))
                        .await;
                }
                "graph_step" => {
                    let _ = engine
                        .execute_graph_step(
                            run_id,
                            payload["stepName"].as_str().unwrap(),
                            payload["input"].clone(),
                            graph.expect("graph item needs a graph"),
                        )
                        .await;
                }
                other => panic!("unexpected work item kind '{other}'"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Imperative workflows: caching, retries, locks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_do_calls_invoke_rpc_exactly_once() {
    let rpc = ScriptedRpc::new().script(
        "chargeCard",
        vec![Behavior::Succeed(json!({"receipt": "r-77"}))],
    );
    let engine = inline_engine(rpc);

    engine.register_workflow("order", |wire, _input| async move {
        let first = wire
            .invoke("charge", "chargeCard", json!({"amount": 10}), StepOptions::default())
            .await?;
        // Replays and repeated calls hit the cache, not the RPC.
        let second = wire
            .invoke("charge", "chargeCard", json!({"amount": 10}), StepOptions::default())
            .await?;
        Ok(json!({ "first": first, "second": second }))
    });

    let run_id = engine.start_workflow("order", json!({})).await.unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(engine.rpc().call_count("chargeCard"), 1);
    assert_eq!(
        run.output.unwrap()["second"]["receipt"],
        json!("r-77")
    );
}

#[tokio::test]
async fn concurrent_replays_are_serialized_by_the_run_lock() {
    let engine = WorkflowEngine::new(
        MemoryStore::new(),
        ConcurrencyProbe::default(),
        EngineConfig::default(),
    );

    engine.register_workflow("probe", |wire, _input| async move {
        wire.invoke("sense", "probe.sense", json!({}), StepOptions::default())
            .await
    });

    let run = WorkflowRun::new("probe", json!({}), true);
    let run_id = run.id;
    engine.store().create_run(&run).await.unwrap();

    let (a, b) = tokio::join!(
        engine.orchestrate_workflow(run_id),
        engine.orchestrate_workflow(run_id),
    );
    a.unwrap();
    b.unwrap();

    let probe = engine.rpc();
    assert_eq!(probe.max_active.load(Ordering::SeqCst), 1, "bodies overlapped");
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1, "cache missed on replay");

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn permanently_failing_step_stops_at_the_retry_bound() {
    let rpc = ScriptedRpc::new().script(
        "chargeCard",
        vec![
            Behavior::Fail("declined"),
            Behavior::Fail("declined"),
            Behavior::Fail("declined"),
        ],
    );
    let engine = inline_engine(rpc);

    engine.register_workflow("order", |wire, _input| async move {
        wire.invoke("charge", "chargeCard", json!({"amount": 10}), fast_options(2))
            .await
    });

    let run_id = engine.start_workflow("order", json!({})).await.unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_ref().unwrap().message, "declined");

    // retries = 2 means exactly 3 attempts.
    let step = engine
        .store()
        .get_step_state(&run_id, "charge")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempt_count, 3);
    assert_eq!(engine.rpc().call_count("chargeCard"), 3);

    let history = engine.store().get_run_history(&run_id).await.unwrap();
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn step_succeeds_on_the_third_attempt() {
    let rpc = ScriptedRpc::new().script(
        "chargeCard",
        vec![
            Behavior::Fail("timeout"),
            Behavior::Fail("timeout"),
            Behavior::Succeed(json!({"receipt": "r-3"})),
        ],
    );
    let engine = inline_engine(rpc);

    engine.register_workflow("order", |wire, _input| async move {
        wire.invoke("charge", "chargeCard", json!({"amount": 10}), fast_options(2))
            .await
    });

    let run_id = engine.start_workflow("order", json!({})).await.unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let step = engine
        .store()
        .get_step_state(&run_id, "charge")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Succeeded);
    assert_eq!(step.attempt_count, 3);
}

#[tokio::test]
async fn unregistered_workflow_fails_fast() {
    let engine = inline_engine(ScriptedRpc::new());
    let err = engine.start_workflow("ghost", json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(_)));
}

// ---------------------------------------------------------------------------
// Imperative workflows: sleep and cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sleep_without_scheduler_blocks_in_place() {
    let engine = inline_engine(ScriptedRpc::new());

    engine.register_workflow("nap", |wire, _input| async move {
        wire.sleep("pause", Duration::from_millis(5)).await?;
        Ok(json!("rested"))
    });

    let run_id = engine.start_workflow("nap", json!({})).await.unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let step = engine
        .store()
        .get_step_state(&run_id, "pause")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.status, StepStatus::Succeeded);
}

#[tokio::test]
async fn sleep_with_scheduler_suspends_until_callback() {
    let scheduler = std::sync::Arc::new(RecordingScheduler::default());
    let engine = WorkflowEngine::new(MemoryStore::new(), ScriptedRpc::new(), EngineConfig::default())
        .with_scheduler(scheduler.clone());

    engine.register_workflow("nap", |wire, _input| async move {
        wire.sleep("pause", Duration::from_secs(3600)).await?;
        Ok(json!("woke"))
    });

    let run_id = engine.start_workflow("nap", json!({})).await.unwrap();

    // Suspended mid-replay: the sleep is registered, nothing is blocked.
    let scheduled = scheduler.scheduled.lock().unwrap().clone();
    assert_eq!(scheduled.len(), 1);
    let (delay, rpc_name, payload) = &scheduled[0];
    assert_eq!(*delay, Duration::from_secs(3600));
    assert_eq!(rpc_name, &EngineConfig::default().sleep_rpc);
    assert_eq!(payload["stepName"], json!("pause"));

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);

    // The scheduler fires: the sleep completes and the run resumes.
    engine.finish_sleep(run_id, "pause").await.unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!("woke")));
}

#[tokio::test]
async fn cancel_marks_the_run_and_raises_the_signal() {
    let engine = inline_engine(ScriptedRpc::new());

    engine.register_workflow("doomed", |wire, _input| async move {
        wire.cancel(Some("out of stock")).await?;
        Ok(json!("unreachable"))
    });

    let run_id = engine.start_workflow("doomed", json!({})).await.unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    let error = run.error.unwrap();
    assert_eq!(error.kind, "CANCELLED");
    assert_eq!(error.message, "out of stock");
}

// ---------------------------------------------------------------------------
// Imperative workflows: queue-distributed mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_workflow_runs_to_completion_through_redelivery() {
    init_tracing();
    let queue = std::sync::Arc::new(RecordingQueue::default());
    let rpc = ScriptedRpc::new().script(
        "chargeCard",
        vec![Behavior::Succeed(json!({"receipt": "r-q"}))],
    );
    let engine = WorkflowEngine::new(MemoryStore::new(), rpc, EngineConfig::default())
        .with_queue(queue.clone());

    engine.register_workflow("order", |wire, _input| async move {
        wire.invoke("charge", "chargeCard", json!({"amount": 10}), StepOptions::default())
            .await
    });

    let run_id = engine.start_workflow("order", json!({})).await.unwrap();

    // Nothing ran yet: the orchestrator continuation is on the queue.
    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(!run.inline);
    assert_eq!(engine.rpc().call_count("chargeCard"), 0);

    pump(&engine, &queue, None).await;

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!({"receipt": "r-q"})));
    assert_eq!(engine.rpc().call_count("chargeCard"), 1);
}

#[tokio::test]
async fn queued_step_carries_retry_policy_to_the_queue() {
    let queue = std::sync::Arc::new(RecordingQueue::default());
    let engine = WorkflowEngine::new(MemoryStore::new(), ScriptedRpc::new(), EngineConfig::default())
        .with_queue(queue.clone());

    engine.register_workflow("order", |wire, _input| async move {
        wire.invoke("charge", "chargeCard", json!({}), fast_options(4)).await
    });

    let run_id = engine.start_workflow("order", json!({})).await.unwrap();
    let _ = engine.orchestrate_workflow(run_id).await;
    // Drop the initial orchestrator item, keep the step item.
    let step_items: Vec<QueueItem> = queue
        .drain()
        .into_iter()
        .filter(|item| item.payload["kind"] == json!("workflow_step"))
        .collect();

    assert_eq!(step_items.len(), 1);
    assert_eq!(step_items[0].queue, EngineConfig::default().step_queue);
    // attempts = retries + 1.
    assert_eq!(step_items[0].attempts, 5);
}

// ---------------------------------------------------------------------------
// Graph runs: references, branches, routing
// ---------------------------------------------------------------------------

fn two_node_graph() -> WorkflowGraph {
    graph(json!({
        "entry_node_ids": ["A"],
        "nodes": {
            "A": {"rpc_name": "svc.a", "next": "B"},
            "B": {
                "rpc_name": "svc.b",
                "input": {"x": {"$ref": "A", "path": "value"}}
            }
        }
    }))
}

#[tokio::test]
async fn data_reference_flows_between_nodes() {
    let rpc = ScriptedRpc::new()
        .script("svc.a", vec![Behavior::Succeed(json!({"value": 7}))])
        .script("svc.b", vec![Behavior::Succeed(json!({"done": true}))]);
    let engine = inline_engine(rpc);

    let g = two_node_graph();
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("pipeline", &g, &hash, json!({}), true)
        .await
        .unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(engine.rpc().calls_for("svc.b"), vec![json!({"x": 7})]);

    // The exact definition is pinned under its hash.
    assert!(
        engine
            .store()
            .get_workflow_version("pipeline", &hash)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn branch_key_false_never_schedules_the_true_target() {
    let rpc = ScriptedRpc::new()
        .script(
            "risk.score",
            vec![Behavior::SucceedWithBranch(json!({"score": 12}), "false")],
        )
        .script("orders.approve", vec![Behavior::Succeed(json!("approved"))]);
    let engine = inline_engine(rpc);

    let g = graph(json!({
        "entry_node_ids": ["score"],
        "nodes": {
            "score": {"rpc_name": "risk.score", "next": {"true": "approve"}},
            "approve": {"rpc_name": "orders.approve"}
        }
    }));
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("review", &g, &hash, json!({}), true)
        .await
        .unwrap();

    // 'approve' was the run's only remaining work; the run completes.
    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(engine.rpc().call_count("orders.approve"), 0);
    assert!(
        engine
            .store()
            .get_step_state(&run_id, "approve")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn parallel_fanout_queues_one_item_per_entry() {
    let queue = std::sync::Arc::new(RecordingQueue::default());
    let engine = WorkflowEngine::new(MemoryStore::new(), ScriptedRpc::new(), EngineConfig::default())
        .with_queue(queue.clone());

    let g = graph(json!({
        "entry_node_ids": ["fetchA", "fetchB", "fetchC"],
        "nodes": {
            "fetchA": {"rpc_name": "svc.a", "input": {"t": {"$ref": "trigger"}}},
            "fetchB": {"rpc_name": "svc.b", "input": {"t": {"$ref": "trigger"}}},
            "fetchC": {"rpc_name": "svc.c", "input": {"t": {"$ref": "trigger"}}}
        }
    }));
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("fanout", &g, &hash, json!({"seed": 1}), false)
        .await
        .unwrap();

    let items = queue.drain();
    let step_items: Vec<&QueueItem> = items
        .iter()
        .filter(|item| item.payload["kind"] == json!("graph_step"))
        .collect();
    assert_eq!(step_items.len(), 3);
    for item in &step_items {
        assert_eq!(item.payload["input"], json!({"t": {"seed": 1}}));
        assert_eq!(run_id_of(&item.payload), run_id);
    }
}

#[tokio::test]
async fn business_error_routes_to_on_error_target() {
    let rpc = ScriptedRpc::new()
        .script("payments.charge", vec![Behavior::Fail("card declined")])
        .script("ops.notify", vec![Behavior::Succeed(json!("paged"))]);
    let engine = inline_engine(rpc);

    let g = graph(json!({
        "entry_node_ids": ["charge"],
        "nodes": {
            "charge": {"rpc_name": "payments.charge", "on_error": "notifyFailure"},
            "notifyFailure": {"rpc_name": "ops.notify"}
        }
    }));
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("billing", &g, &hash, json!({}), true)
        .await
        .unwrap();

    // The failure was routed, so the run did not fail.
    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let notify_calls = engine.rpc().calls_for("ops.notify");
    assert_eq!(
        notify_calls,
        vec![json!({"error": {"message": "card declined"}})]
    );
}

#[tokio::test]
async fn unrouted_node_failure_fails_the_run() {
    let rpc = ScriptedRpc::new().script("payments.charge", vec![Behavior::Fail("card declined")]);
    let engine = inline_engine(rpc);

    let g = graph(json!({
        "entry_node_ids": ["charge"],
        "nodes": {"charge": {"rpc_name": "payments.charge"}}
    }));
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("billing", &g, &hash, json!({}), true)
        .await
        .unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.unwrap().kind, "GRAPH_NODE_FAILED");
}

// ---------------------------------------------------------------------------
// Graph runs: suspend on missing RPC, resume, redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_rpc_suspends_and_resume_skips_completed_nodes() {
    let rpc = ScriptedRpc::new()
        .script("svc.a", vec![Behavior::Succeed(json!({"value": 7}))])
        .script(
            "svc.b",
            vec![Behavior::NotFound, Behavior::Succeed(json!({"done": true}))],
        );
    let engine = inline_engine(rpc);

    let g = two_node_graph();
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("pipeline", &g, &hash, json!({}), true)
        .await
        .unwrap();

    // Deployment-topology error: suspended, not failed.
    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Suspended);
    let error = run.error.unwrap();
    assert_eq!(error.kind, "RPC_NOT_FOUND");
    assert!(error.message.contains("redeploy"));

    // The handler is deployed; the step is re-delivered and the run
    // completes without re-executing A.
    engine
        .execute_graph_step(run_id, "B", json!({"x": 7}), &g)
        .await
        .unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(engine.rpc().call_count("svc.a"), 1);
    assert_eq!(engine.rpc().call_count("svc.b"), 2);
}

#[tokio::test]
async fn graph_runs_to_completion_through_the_queue() {
    init_tracing();
    let queue = std::sync::Arc::new(RecordingQueue::default());
    let rpc = ScriptedRpc::new()
        .script("svc.a", vec![Behavior::Succeed(json!({"value": 3}))])
        .script("svc.b", vec![Behavior::Succeed(json!({"done": true}))]);
    let engine = WorkflowEngine::new(MemoryStore::new(), rpc, EngineConfig::default())
        .with_queue(queue.clone());

    let g = two_node_graph();
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("pipeline", &g, &hash, json!({}), false)
        .await
        .unwrap();

    pump(&engine, &queue, Some(&g)).await;

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(engine.rpc().calls_for("svc.b"), vec![json!({"x": 3})]);
}

#[tokio::test]
async fn redelivered_graph_step_is_idempotent() {
    let queue = std::sync::Arc::new(RecordingQueue::default());
    let rpc = ScriptedRpc::new().script("svc.a", vec![Behavior::Succeed(json!({"value": 3}))]);
    let engine = WorkflowEngine::new(MemoryStore::new(), rpc, EngineConfig::default())
        .with_queue(queue.clone());

    let g = graph(json!({
        "entry_node_ids": ["A"],
        "nodes": {"A": {"rpc_name": "svc.a"}}
    }));
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("single", &g, &hash, json!({}), false)
        .await
        .unwrap();

    // First delivery executes; the duplicate returns the cached result
    // without invoking the RPC again.
    let first = engine
        .execute_graph_step(run_id, "A", json!({}), &g)
        .await
        .unwrap();
    let second = engine
        .execute_graph_step(run_id, "A", json!({}), &g)
        .await
        .unwrap();

    assert_eq!(first, json!({"value": 3}));
    assert_eq!(second, json!({"value": 3}));
    assert_eq!(engine.rpc().call_count("svc.a"), 1);
}

// ---------------------------------------------------------------------------
// Graph runs: templated fan-out and state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn templated_instances_arrive_as_external_deliveries() {
    let rpc = ScriptedRpc::new()
        .script("svc.seed", vec![Behavior::Succeed(json!({"items": 2}))])
        .script(
            "svc.process",
            vec![
                Behavior::Succeed(json!({"n": 1})),
                Behavior::Succeed(json!({"n": 2})),
            ],
        );
    let engine = inline_engine(rpc);

    let g = graph(json!({
        "entry_node_ids": ["seed"],
        "nodes": {
            "seed": {"rpc_name": "svc.seed", "next": "process-{item}"},
            "process-{item}": {"rpc_name": "svc.process"}
        }
    }));
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("fanout", &g, &hash, json!({}), true)
        .await
        .unwrap();

    // The templated successor awaits concrete instances; the run stays open.
    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);

    engine
        .execute_graph_step(run_id, "process-1", json!({"n": 1}), &g)
        .await
        .unwrap();

    // One instance exists now, so the pattern is satisfied and the run
    // completes on the next pass.
    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(engine.rpc().call_count("svc.process"), 1);
}

#[tokio::test]
async fn graph_wire_state_flows_between_nodes() {
    // A writes run state through its wire; B reads it from the snapshot
    // taken before its own invocation.
    let rpc = ScriptedRpc::new()
        .script(
            "svc.a",
            vec![Behavior::SucceedSettingState(
                json!({}),
                "note",
                json!("from-A"),
            )],
        )
        .script("svc.b", vec![Behavior::SucceedEchoingState("note")]);
    let engine = inline_engine(rpc);

    let g = graph(json!({
        "entry_node_ids": ["A"],
        "nodes": {
            "A": {"rpc_name": "svc.a", "next": "B"},
            "B": {"rpc_name": "svc.b"}
        }
    }));
    let hash = graph_hash(&g);
    let run_id = engine
        .run_workflow_graph("stateful", &g, &hash, json!({}), true)
        .await
        .unwrap();

    let run = engine.store().get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    // The write was flushed to the run before B was scheduled.
    assert_eq!(run.state.get("note"), Some(&json!("from-A")));

    let b_state = engine
        .store()
        .get_step_state(&run_id, "B")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b_state.result, Some(json!({"seen": "from-A"})));
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graph_hash_is_required() {
    let engine = inline_engine(ScriptedRpc::new());
    let g = two_node_graph();
    let err = engine
        .run_workflow_graph("pipeline", &g, "", json!({}), true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingGraphHash));
}

#[tokio::test]
async fn dangling_reference_is_rejected_before_any_execution() {
    let engine = inline_engine(ScriptedRpc::new());
    let g = graph(json!({
        "entry_node_ids": ["A"],
        "nodes": {"A": {"rpc_name": "svc.a", "next": "missing"}}
    }));
    let err = engine
        .run_workflow_graph("broken", &g, "h", json!({}), true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Graph(_)));
    // Nothing was invoked.
    assert_eq!(engine.rpc().calls.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn queued_continuation_requires_a_queue() {
    let engine = inline_engine(ScriptedRpc::new());
    let g = two_node_graph();
    let err = engine
        .continue_graph(Uuid::now_v7(), &g)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::QueueNotConfigured));
}

// ---------------------------------------------------------------------------
// Inline-run bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drain_returns_once_inline_runs_settle() {
    let rpc = ScriptedRpc::new().script("svc.a", vec![Behavior::Succeed(json!(1))]);
    let engine = inline_engine(rpc);

    let g = graph(json!({
        "entry_node_ids": ["A"],
        "nodes": {"A": {"rpc_name": "svc.a"}}
    }));
    let hash = graph_hash(&g);
    engine
        .run_workflow_graph("tiny", &g, &hash, json!({}), true)
        .await
        .unwrap();

    assert!(engine.outstanding_inline_runs().is_empty());
    // Nothing outstanding: drain returns immediately.
    tokio::time::timeout(Duration::from_millis(100), engine.drain())
        .await
        .expect("drain should not block");

    engine.store().close().await.unwrap();
}
