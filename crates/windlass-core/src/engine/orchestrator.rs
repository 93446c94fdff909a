//! Replay-driven orchestration of imperative workflows.
//!
//! The orchestrator re-runs the workflow function from the start on every
//! resume. Because step results are cached by name, replay is cheap for
//! already-completed steps and only performs new work at the first
//! not-yet-resolved step, after which the wire raises a suspension signal.
//! Mutual exclusion is explicit: the run lock serializes replays, the step
//! lock makes step-worker invocations idempotent under at-least-once queue
//! delivery.

use serde_json::Value;
use uuid::Uuid;
use windlass_types::run::{RunError, RunStatus};
use windlass_types::step::StepStatus;

use crate::engine::{WorkflowEngine, WorkflowWire};
use crate::error::EngineError;
use crate::services::{RPC_NOT_FOUND, RpcError, RpcService, RpcWire};
use crate::signal::{FlowSignal, STEP_FAILED};
use crate::store::WorkflowStore;

impl<S, R> WorkflowEngine<S, R>
where
    S: WorkflowStore + 'static,
    R: RpcService + 'static,
{
    /// Replay the workflow function for a run under the run lock.
    ///
    /// Returns `EngineError::Suspended`/`Cancelled` for the control-flow
    /// signals -- expected outcomes the caller must recognize, not failures.
    /// Business failures mark the run failed and surface as
    /// `EngineError::RunFailed`.
    pub async fn run_workflow_job(&self, run_id: Uuid) -> Result<(), EngineError> {
        // Lock first so duplicate resumes serialize, then read fresh state:
        // a resume that waited here must observe what the winner persisted.
        // Held for the whole replay; dropped on every exit path, including
        // propagated signals.
        let _guard = self.inner.store.lock_run(&run_id).await?;

        let run = self
            .inner
            .store
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;

        if run.status.is_terminal() {
            tracing::debug!(run_id = %run_id, status = ?run.status, "skipping replay of settled run");
            return Ok(());
        }

        let workflow = self
            .inner
            .workflows
            .get(&run.workflow_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::WorkflowNotFound(run.workflow_name.clone()))?;

        tracing::debug!(run_id = %run_id, workflow = run.workflow_name.as_str(), "replaying workflow");

        let wire = WorkflowWire::new(self.inner.clone(), run_id);
        match workflow(wire, run.input.clone()).await {
            Ok(output) => {
                self.inner
                    .store
                    .update_run_status(&run_id, RunStatus::Completed, Some(&output), None)
                    .await?;
                tracing::info!(run_id = %run_id, "run completed");
                Ok(())
            }
            Err(FlowSignal::Suspend) => {
                // Pause: persist nothing beyond what step handlers already
                // persisted.
                tracing::debug!(run_id = %run_id, "replay suspended");
                Err(EngineError::Suspended)
            }
            Err(FlowSignal::Cancel) => {
                // Already marked cancelled by the wire; rethrow without
                // re-marking.
                Err(EngineError::Cancelled)
            }
            Err(FlowSignal::Fail(error)) => {
                self.inner
                    .store
                    .update_run_status(&run_id, RunStatus::Failed, None, Some(&error))
                    .await?;
                tracing::warn!(run_id = %run_id, error = %error, "run failed");
                Err(EngineError::RunFailed { error })
            }
        }
    }

    /// Drive a run forward, treating suspension and cancellation as expected
    /// outcomes. Any other error marks the run failed.
    pub async fn orchestrate_workflow(&self, run_id: Uuid) -> Result<(), EngineError> {
        match self.run_workflow_job(run_id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_signal() => Ok(()),
            Err(err @ EngineError::RunFailed { .. }) => Err(err),
            Err(err) => {
                // Unexpected (storage, configuration): record it on the run
                // best-effort before surfacing.
                let error = err.to_run_error();
                if let Err(update_err) = self
                    .inner
                    .store
                    .update_run_status(&run_id, RunStatus::Failed, None, Some(&error))
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %update_err, "failed to mark run failed");
                }
                Err(err)
            }
        }
    }

    /// Execute one queued step-worker job under the step lock.
    ///
    /// Idempotent under at-least-once delivery: an already-succeeded step
    /// resumes the orchestrator and returns its cached result; an
    /// already-running step returns without re-executing. Errors are always
    /// returned so the queue layer's delivery accounting stays accurate.
    pub async fn execute_workflow_step(
        &self,
        run_id: Uuid,
        step_name: &str,
        rpc_name: &str,
        payload: Value,
    ) -> Result<Value, EngineError> {
        let _guard = self.inner.store.lock_step(&run_id, step_name).await?;

        let state = self
            .inner
            .store
            .get_step_state(&run_id, step_name)
            .await?
            .ok_or(EngineError::Storage(
                windlass_types::error::StorageError::NotFound,
            ))?;

        let mut attempt = state.attempt_count;
        match state.status {
            StepStatus::Succeeded => {
                tracing::debug!(run_id = %run_id, step = step_name, "redelivery of succeeded step");
                self.resume_run(run_id).await?;
                return Ok(state.result.unwrap_or(Value::Null));
            }
            StepStatus::Running => {
                tracing::debug!(run_id = %run_id, step = step_name, "step already running");
                return Ok(Value::Null);
            }
            StepStatus::Failed if state.attempts_exhausted() => {
                let error = state
                    .error
                    .unwrap_or_else(|| RunError::new(STEP_FAILED, "step failed"));
                self.resume_run(run_id).await?;
                return Err(EngineError::StepFailed {
                    step_name: step_name.to_string(),
                    error,
                });
            }
            StepStatus::Failed => {
                attempt = self
                    .inner
                    .store
                    .create_retry_attempt(&run_id, step_name)
                    .await?;
            }
            StepStatus::Pending | StepStatus::Scheduled => {}
        }

        self.inner.store.set_step_running(&run_id, step_name).await?;
        tracing::debug!(
            run_id = %run_id,
            step = step_name,
            rpc = rpc_name,
            attempt,
            "executing step"
        );

        let wire = RpcWire::workflow(run_id, step_name);
        match self.inner.rpc.call(rpc_name, payload, wire).await {
            Ok(result) => {
                self.inner
                    .store
                    .set_step_result(&run_id, step_name, &result)
                    .await?;
                self.resume_run(run_id).await?;
                Ok(result)
            }
            Err(RpcError::NotFound(name)) => {
                // Topology error: leave the step re-executable and suspend
                // the run instead of failing it.
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
                            format!("rpc '{name}' not found; deploy the handler and resume the run"),
                        )),
                    )
                    .await?;
                tracing::warn!(run_id = %run_id, rpc = name.as_str(), "rpc missing, run suspended");
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

                // With retries remaining, the queue's own redelivery owns the
                // next attempt; once exhausted, resume so the orchestrator
                // can mark the run failed.
                if attempt >= state.retries + 1 {
                    self.resume_run(run_id).await?;
                }

                Err(EngineError::StepFailed {
                    step_name: step_name.to_string(),
                    error,
                })
            }
        }
    }

    /// Scheduler callback target: complete a `sleep` step and resume the
    /// orchestrator.
    pub async fn finish_sleep(&self, run_id: Uuid, step_name: &str) -> Result<(), EngineError> {
        {
            let _guard = self.inner.store.lock_step(&run_id, step_name).await?;

            let state = self
                .inner
                .store
                .get_step_state(&run_id, step_name)
                .await?
                .ok_or(EngineError::Storage(
                    windlass_types::error::StorageError::NotFound,
                ))?;

            if state.status != StepStatus::Succeeded {
                self.inner
                    .store
                    .set_step_result(&run_id, step_name, &Value::Null)
                    .await?;
            }
        }

        tracing::debug!(run_id = %run_id, step = step_name, "sleep finished");
        self.resume_run(run_id).await
    }
}
