//! External collaborator contracts: RPC invocation, queue, scheduler.
//!
//! The RPC collaborator executes the named business function for a step or
//! node. Queue and scheduler collaborators are optional; their absence is a
//! valid configuration that switches the engine to fully in-process
//! semantics, not an error.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;
use windlass_types::step::Backoff;

/// Error code recorded when an RPC target is missing from the deployment.
pub const RPC_NOT_FOUND: &str = "RPC_NOT_FOUND";

// ---------------------------------------------------------------------------
// RPC collaborator
// ---------------------------------------------------------------------------

/// Errors from the RPC collaborator.
///
/// `NotFound` is a deployment-topology condition, deliberately distinct from
/// business failures: the engine suspends the run instead of failing it.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc '{0}' not found")]
    NotFound(String),

    #[error("rpc failed: {message}")]
    Failed {
        message: String,
        trace: Option<String>,
    },
}

impl RpcError {
    /// Build a business failure without a trace.
    pub fn failed(message: impl Into<String>) -> Self {
        RpcError::Failed {
            message: message.into(),
            trace: None,
        }
    }
}

/// Executes named business functions on behalf of the engine.
pub trait RpcService: Send + Sync {
    /// Invoke `rpc_name` with `payload` and the execution-scoped wire.
    fn call(
        &self,
        rpc_name: &str,
        payload: Value,
        wire: RpcWire,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;
}

// ---------------------------------------------------------------------------
// Wire context passed to business functions
// ---------------------------------------------------------------------------

/// Execution-scoped context handed to the RPC collaborator.
///
/// Constructed once per invocation; the scope distinguishes imperative
/// workflow steps from graph nodes.
#[derive(Debug, Clone)]
pub struct RpcWire {
    /// The run this invocation belongs to.
    pub run_id: Uuid,
    /// The step name being executed.
    pub step_name: String,
    /// Workflow- or graph-scoped facilities.
    pub scope: WireScope,
}

/// The execution scope of a wire.
#[derive(Debug, Clone)]
pub enum WireScope {
    /// An imperative workflow step; no graph facilities.
    Workflow,
    /// A graph node; carries the per-execution graph cell.
    Graph(GraphCell),
}

impl RpcWire {
    /// Wire for an imperative workflow step.
    pub fn workflow(run_id: Uuid, step_name: impl Into<String>) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            scope: WireScope::Workflow,
        }
    }

    /// Wire for a graph node, seeded with a snapshot of the run state.
    pub fn graph(run_id: Uuid, step_name: impl Into<String>, state: Map<String, Value>) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            scope: WireScope::Graph(GraphCell::new(state)),
        }
    }

    /// Record the branch key for this node execution. Ignored outside graph
    /// scope.
    pub fn branch(&self, key: impl Into<String>) {
        match &self.scope {
            WireScope::Graph(cell) => cell.set_branch(key.into()),
            WireScope::Workflow => {
                tracing::warn!(step = self.step_name.as_str(), "branch() outside graph scope");
            }
        }
    }

    /// Read a run-state value (snapshot taken before invocation, overlaid
    /// with this execution's own writes).
    pub fn get_state(&self, key: &str) -> Option<Value> {
        match &self.scope {
            WireScope::Graph(cell) => cell.get_state(key),
            WireScope::Workflow => None,
        }
    }

    /// The graph cell, when this wire is graph-scoped.
    pub(crate) fn cell(&self) -> Option<GraphCell> {
        match &self.scope {
            WireScope::Graph(cell) => Some(cell.clone()),
            WireScope::Workflow => None,
        }
    }

    /// Write a run-state value. Buffered; the engine persists writes after
    /// the node returns, before successors are scheduled.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        match &self.scope {
            WireScope::Graph(cell) => cell.set_state(key.into(), value),
            WireScope::Workflow => {
                tracing::warn!(
                    step = self.step_name.as_str(),
                    "set_state() outside graph scope"
                );
            }
        }
    }
}

/// Shared per-node-execution state: the branch key chosen during execution
/// and buffered run-state writes. Discarded after the node completes.
#[derive(Debug, Clone, Default)]
pub struct GraphCell {
    inner: Arc<Mutex<GraphWireState>>,
}

#[derive(Debug, Default)]
struct GraphWireState {
    branch: Option<String>,
    snapshot: Map<String, Value>,
    writes: Map<String, Value>,
}

impl GraphCell {
    fn new(snapshot: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GraphWireState {
                branch: None,
                snapshot,
                writes: Map::new(),
            })),
        }
    }

    fn set_branch(&self, key: String) {
        self.inner.lock().unwrap().branch = Some(key);
    }

    fn get_state(&self, key: &str) -> Option<Value> {
        let state = self.inner.lock().unwrap();
        state
            .writes
            .get(key)
            .or_else(|| state.snapshot.get(key))
            .cloned()
    }

    fn set_state(&self, key: String, value: Value) {
        self.inner.lock().unwrap().writes.insert(key, value);
    }

    /// Take the recorded branch key and buffered writes, leaving the cell
    /// empty. Called by the engine after the node returns.
    pub(crate) fn take_outcome(&self) -> (Option<String>, Map<String, Value>) {
        let mut state = self.inner.lock().unwrap();
        (state.branch.take(), std::mem::take(&mut state.writes))
    }
}

// ---------------------------------------------------------------------------
// Queue collaborator
// ---------------------------------------------------------------------------

/// Errors from the queue/scheduler collaborators.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("enqueue failed: {0}")]
    Enqueue(String),

    #[error("schedule failed: {0}")]
    Schedule(String),
}

/// Delivery options for an enqueued work item.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Total delivery attempts the queue should make (retries + 1).
    pub attempts: u32,
    /// Backoff shape between redeliveries.
    pub backoff: Option<Backoff>,
    /// Base backoff delay between redeliveries.
    pub backoff_delay: Option<Duration>,
    /// Initial delivery delay.
    pub delay: Option<Duration>,
}

/// Enqueues continuation work items. Object-safe so the engine can hold any
/// implementation behind `Arc<dyn QueueService>`.
pub trait QueueService: Send + Sync {
    fn enqueue<'a>(
        &'a self,
        queue: &'a str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>>;
}

/// Schedules a one-shot RPC callback after a delay. Object-safe, same as
/// [`QueueService`].
pub trait SchedulerService: Send + Sync {
    fn schedule_rpc<'a>(
        &'a self,
        delay: Duration,
        rpc_name: &'a str,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
