//! The workflow engine: shared state, registry, and run lifecycle.
//!
//! `WorkflowEngine` is the stateful coordinator both execution styles hang
//! off. It holds the storage backend, the RPC collaborator, the optional
//! queue/scheduler collaborators, static configuration, the imperative
//! workflow-function registry, and the set of outstanding inline graph
//! executions (drain/shutdown bookkeeping only -- correctness never depends
//! on it).
//!
//! - `orchestrator` -- replay-driven imperative workflow execution
//! - `wire` -- the step primitives exposed to workflow function bodies

pub mod orchestrator;
pub mod wire;

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::Notify;
use uuid::Uuid;
use windlass_types::run::WorkflowRun;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::services::{EnqueueOptions, QueueService, RpcService, SchedulerService};
use crate::signal::FlowSignal;
use crate::store::WorkflowStore;

pub use wire::WorkflowWire;

// ---------------------------------------------------------------------------
// Workflow function registry
// ---------------------------------------------------------------------------

/// A registered imperative workflow function.
///
/// The body receives a wire (its handle to `invoke`/`sleep`/`cancel`) and the
/// run input, and must be deterministic given the same step outcomes: replays
/// re-enter the body from the start and rely on step caching to reach the
/// same next suspension point.
pub type WorkflowFn<S, R> =
    Arc<dyn Fn(WorkflowWire<S, R>, Value) -> BoxFuture<'static, Result<Value, FlowSignal>> + Send + Sync>;

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Durable workflow engine, generic over the storage backend and the RPC
/// collaborator.
pub struct WorkflowEngine<S, R> {
    pub(crate) inner: Arc<EngineInner<S, R>>,
}

impl<S, R> Clone for WorkflowEngine<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct EngineInner<S, R> {
    pub(crate) store: S,
    pub(crate) rpc: R,
    pub(crate) queue: Option<Arc<dyn QueueService>>,
    pub(crate) scheduler: Option<Arc<dyn SchedulerService>>,
    pub(crate) config: EngineConfig,
    pub(crate) workflows: DashMap<String, WorkflowFn<S, R>>,
    /// Outstanding inline graph executions, keyed by run id.
    pub(crate) inline_runs: DashMap<Uuid, ()>,
    pub(crate) inline_drained: Notify,
}

impl<S, R> WorkflowEngine<S, R>
where
    S: WorkflowStore + 'static,
    R: RpcService + 'static,
{
    /// Create an engine with no queue or scheduler: fully in-process
    /// semantics.
    pub fn new(store: S, rpc: R, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                rpc,
                queue: None,
                scheduler: None,
                config,
                workflows: DashMap::new(),
                inline_runs: DashMap::new(),
                inline_drained: Notify::new(),
            }),
        }
    }

    /// Attach a queue service. Must be called before any runs start.
    pub fn with_queue(mut self, queue: Arc<dyn QueueService>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_queue must be called before the engine is shared");
        inner.queue = Some(queue);
        self
    }

    /// Attach a scheduler service. Must be called before any runs start.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn SchedulerService>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_scheduler must be called before the engine is shared");
        inner.scheduler = Some(scheduler);
        self
    }

    /// Access the storage backend.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Access the RPC collaborator.
    pub fn rpc(&self) -> &R {
        &self.inner.rpc
    }

    /// Register an imperative workflow function under a name.
    pub fn register_workflow<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(WorkflowWire<S, R>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, FlowSignal>> + Send + 'static,
    {
        let name = name.into();
        let wrapped: WorkflowFn<S, R> = Arc::new(move |wire, input| Box::pin(f(wire, input)));
        self.inner.workflows.insert(name, wrapped);
    }

    /// Start a new run of a registered workflow.
    ///
    /// With a queue configured, enqueues an orchestrator continuation and
    /// returns immediately; without one, runs the workflow function once in
    /// place (the run's outcome is recorded on the run record either way).
    pub async fn start_workflow(&self, name: &str, input: Value) -> Result<Uuid, EngineError> {
        if !self.inner.workflows.contains_key(name) {
            return Err(EngineError::WorkflowNotFound(name.to_string()));
        }

        let run = WorkflowRun::new(name, input, self.inner.queue.is_none());
        let run_id = run.id;
        self.inner.store.create_run(&run).await?;

        tracing::info!(run_id = %run_id, workflow = name, "workflow run started");

        match &self.inner.queue {
            Some(queue) => {
                queue
                    .enqueue(
                        &self.inner.config.orchestrator_queue,
                        json!({ "kind": "workflow", "runId": run_id }),
                        EnqueueOptions::default(),
                    )
                    .await?;
            }
            None => {
                if let Err(err) = self.orchestrate_workflow(run_id).await {
                    tracing::warn!(run_id = %run_id, error = %err, "inline run ended in error");
                }
            }
        }

        Ok(run_id)
    }

    /// Resume a run's orchestrator: enqueue a continuation when a queue
    /// exists, otherwise orchestrate in place.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        match &self.inner.queue {
            Some(queue) => {
                queue
                    .enqueue(
                        &self.inner.config.orchestrator_queue,
                        json!({ "kind": "workflow", "runId": run_id }),
                        EnqueueOptions::default(),
                    )
                    .await?;
                Ok(())
            }
            None => {
                // Failures are recorded on the run by the orchestrator; a
                // resume triggered from a step worker must not mask the
                // step's own outcome.
                if let Err(err) = self.orchestrate_workflow(run_id).await {
                    tracing::debug!(run_id = %run_id, error = %err, "resume ended in error");
                }
                Ok(())
            }
        }
    }

    /// Wait until no inline graph executions remain outstanding.
    pub async fn drain(&self) {
        loop {
            if self.inner.inline_runs.is_empty() {
                return;
            }
            let notified = self.inner.inline_drained.notified();
            if self.inner.inline_runs.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Run ids of inline graph executions currently in progress.
    pub fn outstanding_inline_runs(&self) -> Vec<Uuid> {
        self.inner.inline_runs.iter().map(|e| *e.key()).collect()
    }
}

// ---------------------------------------------------------------------------
// Inline-run tracking guard
// ---------------------------------------------------------------------------

/// Registers a run in the inline set for the duration of its execution.
pub(crate) struct InlineGuard<S, R> {
    inner: Arc<EngineInner<S, R>>,
    run_id: Uuid,
}

impl<S, R> InlineGuard<S, R> {
    pub(crate) fn new(inner: Arc<EngineInner<S, R>>, run_id: Uuid) -> Self {
        inner.inline_runs.insert(run_id, ());
        Self { inner, run_id }
    }
}

impl<S, R> Drop for InlineGuard<S, R> {
    fn drop(&mut self) {
        self.inner.inline_runs.remove(&self.run_id);
        self.inner.inline_drained.notify_waiters();
    }
}
