//! Queued and inline driving algorithms for graph runs.
//!
//! Both modes re-run the shared readiness & routing computation on every
//! pass. Queued mode persists each ready node and dispatches it as an
//! independent work item, re-entering on every step worker completion.
//! Inline mode runs the same computation in a tight loop, executing all
//! currently-ready nodes concurrently until no progress is possible.

use std::collections::BTreeSet;

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use uuid::Uuid;
use windlass_types::graph::{NodeSpec, WorkflowGraph, WorkflowVersion};
use windlass_types::run::{RunError, RunStatus, WorkflowRun};
use windlass_types::step::{Backoff, StepState, StepStatus};

use crate::engine::{InlineGuard, WorkflowEngine};
use crate::error::EngineError;
use crate::graph::input::{TRIGGER, input_dependencies, resolve_input};
use crate::graph::pattern::is_templated;
use crate::graph::ready::{
    NodeStates, candidate_nodes, dependencies_satisfied, fresh_candidates, map_snapshot,
    run_is_complete,
};
use crate::graph::validate::GraphIndex;
use crate::services::{EnqueueOptions, QueueService, RPC_NOT_FOUND, RpcError, RpcService, RpcWire};
use crate::signal::STEP_FAILED;
use crate::store::WorkflowStore;

/// Error code recorded when a graph node fails terminally without routing.
pub const GRAPH_NODE_FAILED: &str = "GRAPH_NODE_FAILED";

impl<S, R> WorkflowEngine<S, R>
where
    S: WorkflowStore + 'static,
    R: RpcService + 'static,
{
    /// Validate a graph, pin its version, create the run, and dispatch the
    /// initial ready entries.
    ///
    /// `graph_hash` identifies the exact definition for version pinning and
    /// is required. The run executes inline when `inline` is set or no queue
    /// service is configured.
    pub async fn run_workflow_graph(
        &self,
        name: &str,
        graph: &WorkflowGraph,
        graph_hash: &str,
        input: Value,
        inline: bool,
    ) -> Result<Uuid, EngineError> {
        if graph_hash.is_empty() {
            return Err(EngineError::MissingGraphHash);
        }
        // Fail fast on dangling references before anything is persisted.
        GraphIndex::build(graph)?;

        self.inner
            .store
            .upsert_workflow_version(&WorkflowVersion {
                workflow_name: name.to_string(),
                graph_hash: graph_hash.to_string(),
                graph: graph.clone(),
                created_at: Utc::now(),
            })
            .await?;

        let effective_inline = inline || self.inner.queue.is_none();
        let run = WorkflowRun::new(name, input, effective_inline).with_graph_hash(graph_hash);
        let run_id = run.id;
        self.inner.store.create_run(&run).await?;

        tracing::info!(
            run_id = %run_id,
            workflow = name,
            graph_hash,
            inline = effective_inline,
            "graph run started"
        );

        if effective_inline {
            self.continue_graph_inline(run_id, graph).await?;
        } else {
            self.continue_graph(run_id, graph).await?;
        }

        Ok(run_id)
    }

    /// One queued-mode continuation pass: dispatch every ready node as an
    /// independent work item, or settle the run when nothing remains.
    pub async fn continue_graph(
        &self,
        run_id: Uuid,
        graph: &WorkflowGraph,
    ) -> Result<(), EngineError> {
        let queue = self
            .inner
            .queue
            .clone()
            .ok_or(EngineError::QueueNotConfigured)?;
        let index = GraphIndex::build(graph)?;

        let run = self
            .inner
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(());
        }

        let snapshot = self.inner.store.graph_snapshot(&run_id).await?;
        let states = map_snapshot(&index, &snapshot)?;

        if !states.failed_fatal.is_empty() {
            self.mark_graph_failed(run_id, &states).await?;
            return Ok(());
        }

        let routed = self
            .dispatch_error_routes(&index, run_id, &states, Some(queue.as_ref()))
            .await?;

        let candidates = candidate_nodes(&index, &states)?;
        let fresh = fresh_candidates(&index, &states, &candidates);
        let ready = self.ready_nodes(run_id, &index, &states, &fresh).await?;

        if ready.is_empty() {
            if routed == 0 && run_is_complete(&states, &fresh) {
                self.complete_graph_run(run_id).await?;
            }
            return Ok(());
        }

        let results = self.results_for(run_id, &run.input, &ready).await?;
        for (node_id, spec) in ready {
            let input = resolve_input(&spec.input, &results)?;
            self.dispatch_graph_step(queue.as_ref(), run_id, &run, node_id, spec, input)
                .await?;
        }

        Ok(())
    }

    /// Execute one graph node as a step worker, under the step lock.
    ///
    /// Handles at-least-once redelivery (succeeded and running steps no-op),
    /// creates retry attempts for redelivered failures, suspends the whole
    /// run on a missing RPC, and resumes the orchestrator on completion and
    /// on terminal failure.
    pub async fn execute_graph_step(
        &self,
        run_id: Uuid,
        step_name: &str,
        input: Value,
        graph: &WorkflowGraph,
    ) -> Result<Value, EngineError> {
        let index = GraphIndex::build(graph)?;
        let (node_id, spec) = index.resolve_required(step_name)?;

        let retries = spec.retries.unwrap_or(self.inner.config.default_retries);
        let retry_delay_ms = spec
            .retry_delay_ms
            .unwrap_or(self.inner.config.default_retry_delay.as_millis() as u64);

        let _guard = self.inner.store.lock_step(&run_id, step_name).await?;

        let existing = self.inner.store.get_step_state(&run_id, step_name).await?;
        let attempt = match existing {
            Some(state) => match state.status {
                StepStatus::Succeeded => {
                    tracing::debug!(run_id = %run_id, step = step_name, "redelivery of succeeded node");
                    self.resume_graph(run_id, graph).await?;
                    return Ok(state.result.unwrap_or(Value::Null));
                }
                StepStatus::Running => {
                    tracing::debug!(run_id = %run_id, step = step_name, "node already running");
                    return Ok(Value::Null);
                }
                StepStatus::Failed if state.attempts_exhausted() => {
                    let error = state
                        .error
                        .unwrap_or_else(|| RunError::new(STEP_FAILED, "node failed"));
                    self.resume_graph(run_id, graph).await?;
                    return Err(EngineError::StepFailed {
                        step_name: step_name.to_string(),
                        error,
                    });
                }
                StepStatus::Failed => {
                    self.inner
                        .store
                        .create_retry_attempt(&run_id, step_name)
                        .await?
                }
                StepStatus::Pending | StepStatus::Scheduled => state.attempt_count,
            },
            None => {
                // First sighting of this step name -- the normal path for
                // externally-delivered instances of templated nodes.
                let state = StepState::new(step_name, retries, retry_delay_ms);
                self.inner.store.insert_step_state(&run_id, &state).await?;
                1
            }
        };

        let Some(rpc_name) = spec.rpc_name.as_deref() else {
            // Pure routing node: completes immediately.
            self.inner
                .store
                .set_step_result(&run_id, step_name, &Value::Null)
                .await?;
            self.resume_graph(run_id, graph).await?;
            return Ok(Value::Null);
        };

        self.inner.store.set_step_running(&run_id, step_name).await?;
        tracing::debug!(
            run_id = %run_id,
            step = step_name,
            node = node_id,
            rpc = rpc_name,
            attempt,
            "executing graph node"
        );

        let run_state = self.inner.store.get_run_state(&run_id).await?;
        let wire = RpcWire::graph(run_id, step_name, run_state);
        let cell = wire.cell().expect("graph wire has a cell");

        match self.inner.rpc.call(rpc_name, input, wire).await {
            Ok(value) => {
                self.flush_wire_outcome(run_id, step_name, &cell).await?;
                self.inner
                    .store
                    .set_step_result(&run_id, step_name, &value)
                    .await?;

                // A run suspended on a missing RPC comes back once a node
                // executes again after the redeploy.
                if let Some(run) = self.inner.store.get_run(&run_id).await? {
                    if run.status == RunStatus::Suspended {
                        self.inner
                            .store
                            .update_run_status(&run_id, RunStatus::Running, None, None)
                            .await?;
                    }
                }

                self.resume_graph(run_id, graph).await?;
                Ok(value)
            }
            Err(RpcError::NotFound(name)) => {
                self.suspend_for_missing_rpc(run_id, step_name, &name).await?;
                Err(EngineError::RpcNotFound(name))
            }
            Err(RpcError::Failed { message, trace }) => {
                let error = RunError {
                    kind: STEP_FAILED.to_string(),
                    message,
                    trace,
                };
                self.inner
                    .store
                    .set_step_error(&run_id, step_name, &error)
                    .await?;

                // With retries remaining the queue redelivers; once
                // exhausted, resume so the continuation pass can route the
                // error or fail the run.
                if attempt >= retries + 1 {
                    self.resume_graph(run_id, graph).await?;
                }

                Err(EngineError::StepFailed {
                    step_name: step_name.to_string(),
                    error,
                })
            }
        }
    }

    /// Drive a run to quiescence fully in-process.
    ///
    /// Each pass executes all currently-ready nodes concurrently, then
    /// recomputes readiness, until no progress is possible; error routing is
    /// handled by the same loop. The run is tracked in the outstanding
    /// inline set for the duration.
    pub async fn continue_graph_inline(
        &self,
        run_id: Uuid,
        graph: &WorkflowGraph,
    ) -> Result<(), EngineError> {
        let _tracking = InlineGuard::new(self.inner.clone(), run_id);
        let index = GraphIndex::build(graph)?;

        let run = self
            .inner
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(());
        }

        loop {
            let snapshot = self.inner.store.graph_snapshot(&run_id).await?;
            let states = map_snapshot(&index, &snapshot)?;

            if !states.failed_fatal.is_empty() {
                self.mark_graph_failed(run_id, &states).await?;
                return Ok(());
            }

            // Error routing, awaited in place; the next pass observes the
            // targets' outcomes (including their own routed failures).
            let routed = self
                .dispatch_error_routes(&index, run_id, &states, None)
                .await?;
            if routed > 0 {
                continue;
            }

            let candidates = candidate_nodes(&index, &states)?;
            let fresh = fresh_candidates(&index, &states, &candidates);
            let ready = self.ready_nodes(run_id, &index, &states, &fresh).await?;

            if ready.is_empty() {
                if run_is_complete(&states, &fresh) {
                    self.complete_graph_run(run_id).await?;
                }
                return Ok(());
            }

            let results = self.results_for(run_id, &run.input, &ready).await?;
            let mut executions = Vec::with_capacity(ready.len());
            for (node_id, spec) in &ready {
                let input = resolve_input(&spec.input, &results)?;
                executions.push(self.run_node_inline(run_id, node_id, spec, input));
            }

            for outcome in join_all(executions).await {
                match outcome {
                    Ok(()) => {}
                    // Missing RPC suspended the run; stop making progress.
                    Err(EngineError::RpcNotFound(_)) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// Resume graph progress after a node settles: enqueue an orchestrator
    /// continuation when a queue exists, otherwise continue inline.
    pub async fn resume_graph(
        &self,
        run_id: Uuid,
        graph: &WorkflowGraph,
    ) -> Result<(), EngineError> {
        match &self.inner.queue {
            Some(queue) => {
                let graph_hash = self
                    .inner
                    .store
                    .get_run(&run_id)
                    .await?
                    .and_then(|run| run.graph_hash);
                queue
                    .enqueue(
                        &self.inner.config.orchestrator_queue,
                        json!({ "kind": "graph", "runId": run_id, "graphHash": graph_hash }),
                        EnqueueOptions::default(),
                    )
                    .await?;
                Ok(())
            }
            None => self.continue_graph_inline(run_id, graph).await,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Fresh, concrete, dependency-satisfied nodes. Templated candidates are
    /// skipped: their concrete instances arrive as external deliveries.
    async fn ready_nodes<'g>(
        &self,
        run_id: Uuid,
        index: &GraphIndex<'g>,
        states: &NodeStates,
        fresh: &BTreeSet<String>,
    ) -> Result<Vec<(&'g str, &'g NodeSpec)>, EngineError> {
        // Re-check concrete candidates against the store: the snapshot can be
        // stale under concurrent dispatch.
        let concrete: Vec<String> = fresh
            .iter()
            .filter(|node_id| !is_templated(node_id))
            .cloned()
            .collect();
        let without_steps: BTreeSet<String> = self
            .inner
            .store
            .nodes_without_steps(&run_id, &concrete)
            .await?
            .into_iter()
            .collect();

        let mut ready = Vec::new();
        // BTreeSet iteration keeps dispatch order deterministic.
        for node_id in fresh {
            if is_templated(node_id) {
                tracing::debug!(node = node_id.as_str(), "templated node awaits external instances");
                continue;
            }
            if !without_steps.contains(node_id.as_str()) {
                continue;
            }
            let (id, spec) = index.resolve_required(node_id)?;
            if dependencies_satisfied(index, spec, &states.completed)? {
                ready.push((id, spec));
            }
        }
        Ok(ready)
    }

    /// Results map for the ready set: `{ trigger: run input }` plus every
    /// referenced node's stored result.
    async fn results_for(
        &self,
        run_id: Uuid,
        run_input: &Value,
        ready: &[(&str, &NodeSpec)],
    ) -> Result<Map<String, Value>, EngineError> {
        let mut deps = BTreeSet::new();
        for (_, spec) in ready {
            deps.extend(input_dependencies(&spec.input));
        }
        let dep_list: Vec<String> = deps.into_iter().collect();

        let mut results = self.inner.store.node_results(&run_id, &dep_list).await?;
        results.insert(TRIGGER.to_string(), run_input.clone());
        Ok(results)
    }

    /// Dispatch the `on_error` targets of terminally-failed nodes that have
    /// not been dispatched yet, with the synthetic `{"error": {"message"}}`
    /// input. Queued when a queue is given, executed in place otherwise.
    /// Returns how many targets were dispatched.
    async fn dispatch_error_routes(
        &self,
        index: &GraphIndex<'_>,
        run_id: Uuid,
        states: &NodeStates,
        queue: Option<&dyn QueueService>,
    ) -> Result<usize, EngineError> {
        let graph = index.graph();
        let mut dispatched = 0usize;
        let mut seen: BTreeSet<&str> = BTreeSet::new();

        for failure in &states.failed_routed {
            let spec = &graph.nodes[failure.node_id.as_str()];
            let Some(on_error) = &spec.on_error else { continue };

            let message = self
                .inner
                .store
                .get_step_state(&run_id, &failure.step_name)
                .await?
                .and_then(|state| state.error)
                .map(|error| error.message)
                .unwrap_or_else(|| "node failed".to_string());

            for target in on_error.ids() {
                let (target_id, target_spec) = index.resolve_required(target)?;
                if !seen.insert(target_id)
                    || index.has_instance(target_id, states.step_names.iter().map(String::as_str))
                {
                    continue;
                }

                let input = json!({ "error": { "message": message } });
                tracing::debug!(
                    run_id = %run_id,
                    failed = failure.step_name.as_str(),
                    target = target_id,
                    "routing node failure"
                );

                match queue {
                    Some(queue) => {
                        let run = self
                            .inner
                            .store
                            .get_run(&run_id)
                            .await?
                            .ok_or(EngineError::RunNotFound(run_id))?;
                        self.dispatch_graph_step(queue, run_id, &run, target_id, target_spec, input)
                            .await?;
                    }
                    None => match self.run_node_inline(run_id, target_id, target_spec, input).await
                    {
                        Ok(()) | Err(EngineError::RpcNotFound(_)) => {}
                        Err(err) => return Err(err),
                    },
                }
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    /// Persist a ready node and enqueue its work item.
    async fn dispatch_graph_step(
        &self,
        queue: &dyn QueueService,
        run_id: Uuid,
        run: &WorkflowRun,
        node_id: &str,
        spec: &NodeSpec,
        input: Value,
    ) -> Result<(), EngineError> {
        let retries = spec.retries.unwrap_or(self.inner.config.default_retries);
        let retry_delay_ms = spec
            .retry_delay_ms
            .unwrap_or(self.inner.config.default_retry_delay.as_millis() as u64);

        let state = StepState::new(node_id, retries, retry_delay_ms);
        self.inner.store.insert_step_state(&run_id, &state).await?;
        self.inner.store.set_step_scheduled(&run_id, node_id).await?;

        queue
            .enqueue(
                &self.inner.config.step_queue,
                json!({
                    "kind": "graph_step",
                    "runId": run_id,
                    "stepName": node_id,
                    "graphHash": run.graph_hash,
                    "input": input,
                }),
                EnqueueOptions {
                    attempts: retries + 1,
                    backoff: Some(Backoff::Fixed),
                    backoff_delay: Some(std::time::Duration::from_millis(retry_delay_ms)),
                    delay: None,
                },
            )
            .await?;

        tracing::debug!(run_id = %run_id, node = node_id, "graph node queued");
        Ok(())
    }

    /// Execute one node in place, retrying up to its bound. Terminal
    /// business failures are recorded and surface through the next readiness
    /// pass; only topology suspension and storage failures return errors.
    async fn run_node_inline(
        &self,
        run_id: Uuid,
        step_name: &str,
        spec: &NodeSpec,
        input: Value,
    ) -> Result<(), EngineError> {
        let retries = spec.retries.unwrap_or(self.inner.config.default_retries);
        let retry_delay_ms = spec
            .retry_delay_ms
            .unwrap_or(self.inner.config.default_retry_delay.as_millis() as u64);

        let state = StepState::new(step_name, retries, retry_delay_ms);
        self.inner.store.insert_step_state(&run_id, &state).await?;

        let Some(rpc_name) = spec.rpc_name.as_deref() else {
            self.inner
                .store
                .set_step_result(&run_id, step_name, &Value::Null)
                .await?;
            return Ok(());
        };

        let mut attempt = 1u32;
        loop {
            self.inner.store.set_step_running(&run_id, step_name).await?;

            let run_state = self.inner.store.get_run_state(&run_id).await?;
            let wire = RpcWire::graph(run_id, step_name, run_state);
            let cell = wire.cell().expect("graph wire has a cell");

            match self.inner.rpc.call(rpc_name, input.clone(), wire).await {
                Ok(value) => {
                    self.flush_wire_outcome(run_id, step_name, &cell).await?;
                    self.inner
                        .store
                        .set_step_result(&run_id, step_name, &value)
                        .await?;
                    return Ok(());
                }
                Err(RpcError::NotFound(name)) => {
                    self.suspend_for_missing_rpc(run_id, step_name, &name).await?;
                    return Err(EngineError::RpcNotFound(name));
                }
                Err(RpcError::Failed { message, trace }) => {
                    let error = RunError {
                        kind: STEP_FAILED.to_string(),
                        message,
                        trace,
                    };
                    self.inner
                        .store
                        .set_step_error(&run_id, step_name, &error)
                        .await?;

                    if attempt >= retries + 1 {
                        // Recorded; the next readiness pass routes or fails.
                        return Ok(());
                    }

                    attempt = self
                        .inner
                        .store
                        .create_retry_attempt(&run_id, step_name)
                        .await?;

                    let delay = Backoff::Fixed.delay_for_attempt(
                        std::time::Duration::from_millis(retry_delay_ms),
                        attempt,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Persist buffered wire state writes, then the branch key.
    async fn flush_wire_outcome(
        &self,
        run_id: Uuid,
        step_name: &str,
        cell: &crate::services::GraphCell,
    ) -> Result<(), EngineError> {
        let (branch, writes) = cell.take_outcome();
        for (key, value) in &writes {
            self.inner.store.update_run_state(&run_id, key, value).await?;
        }
        if let Some(branch) = branch {
            self.inner
                .store
                .set_branch_taken(&run_id, step_name, &branch)
                .await?;
        }
        Ok(())
    }

    async fn suspend_for_missing_rpc(
        &self,
        run_id: Uuid,
        step_name: &str,
        rpc_name: &str,
    ) -> Result<(), EngineError> {
        // Leave the step re-executable so a later delivery retries it.
        self.inner
            .store
            .set_step_scheduled(&run_id, step_name)
            .await?;
        self.inner
            .store
            .update_run_status(
                &run_id,
                RunStatus::Suspended,
                None,
                Some(&RunError::new(
                    RPC_NOT_FOUND,
                    format!("rpc '{rpc_name}' not found; redeploy the handler and resume the run"),
                )),
            )
            .await?;
        tracing::warn!(run_id = %run_id, rpc = rpc_name, "rpc missing, graph run suspended");
        Ok(())
    }

    async fn mark_graph_failed(
        &self,
        run_id: Uuid,
        states: &NodeStates,
    ) -> Result<(), EngineError> {
        let error = RunError::new(
            GRAPH_NODE_FAILED,
            format!("node(s) failed terminally: {}", states.failed_fatal.join(", ")),
        );
        self.inner
            .store
            .update_run_status(&run_id, RunStatus::Failed, None, Some(&error))
            .await?;
        tracing::warn!(run_id = %run_id, nodes = ?states.failed_fatal, "graph run failed");
        Ok(())
    }

    async fn complete_graph_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.inner
            .store
            .update_run_status(&run_id, RunStatus::Completed, None, None)
            .await?;
        tracing::info!(run_id = %run_id, "graph run completed");
        Ok(())
    }
}
