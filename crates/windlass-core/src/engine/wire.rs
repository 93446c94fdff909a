//! Step primitives exposed to workflow function bodies.
//!
//! The wire is the workflow function's only handle back into the engine.
//! Every call is a potential suspension point: a result of
//! `Err(FlowSignal::Suspend)` means "pause this replay; an external
//! completion will resume it later" and must be propagated with `?`, never
//! swallowed.
//!
//! Step results are cached by name: once a step has succeeded, every later
//! replay returns the stored result without invoking the RPC again, which is
//! what makes replays safe to run any number of times.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;
use windlass_types::error::StorageError;
use windlass_types::run::{RunError, RunStatus};
use windlass_types::step::{Backoff, StepOptions, StepState, StepStatus};

use crate::engine::EngineInner;
use crate::services::{EnqueueOptions, RPC_NOT_FOUND, RpcError, RpcService, RpcWire};
use crate::signal::{CANCELLED, FlowSignal, STEP_FAILED};
use crate::store::WorkflowStore;

// ---------------------------------------------------------------------------
// WorkflowWire
// ---------------------------------------------------------------------------

/// Handle passed to an imperative workflow function body.
pub struct WorkflowWire<S, R> {
    inner: Arc<EngineInner<S, R>>,
    run_id: Uuid,
}

impl<S, R> Clone for WorkflowWire<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            run_id: self.run_id,
        }
    }
}

/// What a step lookup decided.
enum Lookup {
    /// The step already succeeded; return the cached result.
    Cached(Value),
    /// The step failed with no attempts left; fail the run.
    Exhausted(RunError),
    /// Work is owned elsewhere (queued worker, in-flight delivery); suspend.
    Wait,
    /// Execute now, starting at this attempt number.
    Execute { attempt: u32 },
}

impl<S, R> WorkflowWire<S, R>
where
    S: WorkflowStore + 'static,
    R: RpcService + 'static,
{
    pub(crate) fn new(inner: Arc<EngineInner<S, R>>, run_id: Uuid) -> Self {
        Self { inner, run_id }
    }

    /// The run this wire belongs to.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Execute a named step by invoking an RPC (the `do` primitive).
    ///
    /// Cached on success. With a queue configured the step is dispatched as
    /// an independent work item and this call suspends; without one it
    /// executes in place, retrying up to the configured bound.
    pub async fn invoke(
        &self,
        step_name: &str,
        rpc_name: &str,
        payload: Value,
        options: StepOptions,
    ) -> Result<Value, FlowSignal> {
        ensure_step_name(step_name)?;
        let (retries, delay, backoff) = self.effective(options);
        let external = self.inner.queue.is_some();

        match self.lookup(step_name, retries, delay, external).await? {
            Lookup::Cached(value) => {
                tracing::debug!(run_id = %self.run_id, step = step_name, "step cache hit");
                Ok(value)
            }
            Lookup::Exhausted(error) => Err(FlowSignal::Fail(error)),
            Lookup::Wait => Err(FlowSignal::Suspend),
            Lookup::Execute { attempt } => {
                if let Some(queue) = &self.inner.queue {
                    self.inner
                        .store
                        .set_step_scheduled(&self.run_id, step_name)
                        .await
                        .map_err(storage_fail)?;

                    queue
                        .enqueue(
                            &self.inner.config.step_queue,
                            json!({
                                "kind": "workflow_step",
                                "runId": self.run_id,
                                "stepName": step_name,
                                "rpcName": rpc_name,
                                "input": payload,
                            }),
                            EnqueueOptions {
                                attempts: retries + 1,
                                backoff: Some(backoff),
                                backoff_delay: Some(delay),
                                delay: None,
                            },
                        )
                        .await
                        .map_err(|e| {
                            FlowSignal::Fail(RunError::new("QUEUE_ERROR", e.to_string()))
                        })?;

                    tracing::debug!(
                        run_id = %self.run_id,
                        step = step_name,
                        rpc = rpc_name,
                        "step queued"
                    );
                    Err(FlowSignal::Suspend)
                } else {
                    let run_id = self.run_id;
                    self.execute_inline(step_name, payload, retries, delay, backoff, attempt, |p| {
                        self.inner
                            .rpc
                            .call(rpc_name, p, RpcWire::workflow(run_id, step_name))
                    })
                    .await
                }
            }
        }
    }

    /// Execute a named step with an inline closure instead of an RPC.
    ///
    /// Same cache and retry contract as [`invoke`](Self::invoke), without
    /// external dispatch -- the closure runs in place even when a queue is
    /// configured.
    pub async fn invoke_fn<F, Fut>(
        &self,
        step_name: &str,
        payload: Value,
        options: StepOptions,
        f: F,
    ) -> Result<Value, FlowSignal>
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<Value, RpcError>>,
    {
        ensure_step_name(step_name)?;
        let (retries, delay, backoff) = self.effective(options);

        match self.lookup(step_name, retries, delay, false).await? {
            Lookup::Cached(value) => Ok(value),
            Lookup::Exhausted(error) => Err(FlowSignal::Fail(error)),
            Lookup::Wait => Err(FlowSignal::Suspend),
            Lookup::Execute { attempt } => {
                self.execute_inline(step_name, payload, retries, delay, backoff, attempt, f)
                    .await
            }
        }
    }

    /// Idempotent delay (the `sleep` primitive).
    ///
    /// With a scheduler configured, schedules a wake-up callback and
    /// suspends; without one, blocks the current replay for `duration` and
    /// resolves immediately.
    pub async fn sleep(&self, step_name: &str, duration: Duration) -> Result<(), FlowSignal> {
        ensure_step_name(step_name)?;

        let existing = self
            .inner
            .store
            .get_step_state(&self.run_id, step_name)
            .await
            .map_err(storage_fail)?;

        match existing {
            Some(state) if state.status == StepStatus::Succeeded => return Ok(()),
            Some(state)
                if self.inner.scheduler.is_some() && state.status == StepStatus::Scheduled =>
            {
                // Wake-up already scheduled by an earlier replay.
                return Err(FlowSignal::Suspend);
            }
            Some(_) => {}
            None => {
                let state = StepState::new(step_name, 0, 0);
                self.inner
                    .store
                    .insert_step_state(&self.run_id, &state)
                    .await
                    .map_err(storage_fail)?;
            }
        }

        if let Some(scheduler) = &self.inner.scheduler {
            self.inner
                .store
                .set_step_scheduled(&self.run_id, step_name)
                .await
                .map_err(storage_fail)?;

            scheduler
                .schedule_rpc(
                    duration,
                    &self.inner.config.sleep_rpc,
                    json!({ "runId": self.run_id, "stepName": step_name }),
                )
                .await
                .map_err(|e| FlowSignal::Fail(RunError::new("QUEUE_ERROR", e.to_string())))?;

            tracing::debug!(
                run_id = %self.run_id,
                step = step_name,
                delay_ms = duration.as_millis() as u64,
                "sleep scheduled"
            );
            Err(FlowSignal::Suspend)
        } else {
            tokio::time::sleep(duration).await;
            self.inner
                .store
                .set_step_result(&self.run_id, step_name, &Value::Null)
                .await
                .map_err(storage_fail)?;
            Ok(())
        }
    }

    /// Cancel the run (the `cancel` primitive). Marks the run cancelled and
    /// raises the cancellation signal; the body should propagate it with `?`.
    pub async fn cancel(&self, reason: Option<&str>) -> Result<(), FlowSignal> {
        let error = RunError::new(CANCELLED, reason.unwrap_or("workflow cancelled"));
        self.inner
            .store
            .update_run_status(&self.run_id, RunStatus::Cancelled, None, Some(&error))
            .await
            .map_err(storage_fail)?;

        tracing::info!(run_id = %self.run_id, reason = reason.unwrap_or(""), "run cancelled");
        Err(FlowSignal::Cancel)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn effective(&self, options: StepOptions) -> (u32, Duration, Backoff) {
        (
            options.retries.unwrap_or(self.inner.config.default_retries),
            options
                .retry_delay
                .unwrap_or(self.inner.config.default_retry_delay),
            options.backoff.unwrap_or(Backoff::Fixed),
        )
    }

    /// Look up or create step state and decide what this replay should do.
    ///
    /// `external` is true when a queue owns dispatch for this step: failed
    /// and in-flight states then wait for the queue's own redelivery instead
    /// of executing here.
    async fn lookup(
        &self,
        step_name: &str,
        retries: u32,
        delay: Duration,
        external: bool,
    ) -> Result<Lookup, FlowSignal> {
        let existing = self
            .inner
            .store
            .get_step_state(&self.run_id, step_name)
            .await
            .map_err(storage_fail)?;

        let Some(state) = existing else {
            let state = StepState::new(step_name, retries, delay.as_millis() as u64);
            self.inner
                .store
                .insert_step_state(&self.run_id, &state)
                .await
                .map_err(storage_fail)?;
            return Ok(Lookup::Execute { attempt: 1 });
        };

        match state.status {
            StepStatus::Succeeded => Ok(Lookup::Cached(state.result.unwrap_or(Value::Null))),
            StepStatus::Failed if state.attempts_exhausted() => {
                let error = state
                    .error
                    .unwrap_or_else(|| RunError::new(STEP_FAILED, "step failed"));
                Ok(Lookup::Exhausted(error))
            }
            StepStatus::Failed => {
                if external {
                    Ok(Lookup::Wait)
                } else {
                    let attempt = self
                        .inner
                        .store
                        .create_retry_attempt(&self.run_id, step_name)
                        .await
                        .map_err(storage_fail)?;
                    Ok(Lookup::Execute { attempt })
                }
            }
            StepStatus::Running | StepStatus::Scheduled if external => Ok(Lookup::Wait),
            StepStatus::Running | StepStatus::Scheduled | StepStatus::Pending => {
                Ok(Lookup::Execute {
                    attempt: state.attempt_count,
                })
            }
        }
    }

    /// Run a step in place, retrying with fresh attempts up to the bound.
    async fn execute_inline<F, Fut>(
        &self,
        step_name: &str,
        payload: Value,
        retries: u32,
        base_delay: Duration,
        backoff: Backoff,
        mut attempt: u32,
        call: F,
    ) -> Result<Value, FlowSignal>
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<Value, RpcError>>,
    {
        loop {
            self.inner
                .store
                .set_step_running(&self.run_id, step_name)
                .await
                .map_err(storage_fail)?;

            tracing::debug!(
                run_id = %self.run_id,
                step = step_name,
                attempt,
                "executing step inline"
            );

            match call(payload.clone()).await {
                Ok(value) => {
                    self.inner
                        .store
                        .set_step_result(&self.run_id, step_name, &value)
                        .await
                        .map_err(storage_fail)?;
                    return Ok(value);
                }
                Err(RpcError::NotFound(name)) => {
                    // Deployment-topology error: suspend the run so it can be
                    // resumed after a redeploy, leaving the step re-executable.
                    self.inner
                        .store
                        .set_step_scheduled(&self.run_id, step_name)
                        .await
                        .map_err(storage_fail)?;
                    self.inner
                        .store
                        .update_run_status(
                            &self.run_id,
                            RunStatus::Suspended,
                            None,
                            Some(&RunError::new(
                                RPC_NOT_FOUND,
                                format!("rpc '{name}' not found; deploy the handler and resume the run"),
                            )),
                        )
                        .await
                        .map_err(storage_fail)?;

                    tracing::warn!(run_id = %self.run_id, rpc = name.as_str(), "rpc missing, run suspended");
                    return Err(FlowSignal::Suspend);
                }
                Err(RpcError::Failed { message, trace }) => {
                    let error = RunError {
                        kind: STEP_FAILED.to_string(),
                        message,
                        trace,
                    };
                    self.inner
                        .store
                        .set_step_error(&self.run_id, step_name, &error)
                        .await
                        .map_err(storage_fail)?;

                    if attempt >= retries + 1 {
                        return Err(FlowSignal::Fail(error));
                    }

                    attempt = self
                        .inner
                        .store
                        .create_retry_attempt(&self.run_id, step_name)
                        .await
                        .map_err(storage_fail)?;

                    let delay = backoff.delay_for_attempt(base_delay, attempt);
                    tracing::debug!(
                        run_id = %self.run_id,
                        step = step_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying step"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_step_name(step_name: &str) -> Result<(), FlowSignal> {
    if step_name.is_empty() {
        return Err(FlowSignal::Fail(RunError::new(
            "INVALID_STEP_NAME",
            "step name must be a non-empty string",
        )));
    }
    Ok(())
}

fn storage_fail(error: StorageError) -> FlowSignal {
    FlowSignal::Fail(RunError::new("STORAGE_ERROR", error.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
