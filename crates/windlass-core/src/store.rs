//! Storage contract for workflow persistence.
//!
//! Defines the storage interface the engine drives: runs, step state, step
//! attempt history, graph bookkeeping, and locking primitives. The
//! infrastructure layer implements this trait; the engine never knows which
//! backend (relational, document, key-value, in-memory) it is talking to.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use std::collections::HashMap;
use std::future::Future;

use serde_json::{Map, Value};
use uuid::Uuid;
use windlass_types::error::StorageError;
use windlass_types::graph::WorkflowVersion;
use windlass_types::run::{RunError, RunStatus, WorkflowRun};
use windlass_types::step::{StepAttempt, StepState};

// ---------------------------------------------------------------------------
// Graph snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of a graph run's step records, keyed by runtime step
/// name. The engine maps step names back to (possibly templated) node ids.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    /// Step names that succeeded.
    pub completed: Vec<String>,
    /// Step names that failed terminally (`attempt_count >= retries + 1`).
    pub failed: Vec<String>,
    /// Step names with records that are neither succeeded nor terminally
    /// failed -- work in flight.
    pub in_flight: Vec<String>,
    /// Branch key recorded per completed step name.
    pub branches: HashMap<String, String>,
}

impl GraphSnapshot {
    /// Every step name with any record in this run.
    pub fn all_step_names(&self) -> impl Iterator<Item = &str> {
        self.completed
            .iter()
            .chain(self.failed.iter())
            .chain(self.in_flight.iter())
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore trait
// ---------------------------------------------------------------------------

/// Storage contract for workflow runs, steps, and graph bookkeeping.
///
/// Covers four entity families:
/// - **Runs:** create/query execution instances, update status and state.
/// - **Steps:** one logical state per (run, step name) plus an append-only
///   attempt history.
/// - **Locks:** scoped mutual exclusion per run and per (run, step name).
///   Acquisition returns an RAII guard released on drop, which guarantees
///   release on every exit path including propagated signals. Backends
///   choose the underlying primitive (row locks, leased keys, advisory
///   locks); only the scoped-acquisition contract is required.
/// - **Graphs:** per-run readiness bookkeeping and pinned graph versions.
pub trait WorkflowStore: Send + Sync {
    /// Guard holding the per-run orchestrator lock.
    type RunLock: Send;
    /// Guard holding the per-(run, step) worker lock.
    type StepLock: Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Persist a new run record.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Get a run by id.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowRun>, StorageError>> + Send;

    /// Full attempt history for a run, ordered by start time.
    fn get_run_history(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<StepAttempt>, StorageError>> + Send;

    /// Update a run's status and optionally its output / error.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        output: Option<&Value>,
        error: Option<&RunError>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Write one key of the run-scoped key/value memory.
    fn update_run_state(
        &self,
        run_id: &Uuid,
        key: &str,
        value: &Value,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Read the run-scoped key/value memory.
    fn get_run_state(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Map<String, Value>, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Create step state for (run, step name) and record its first attempt.
    /// Conflict if the step already exists.
    fn insert_step_state(
        &self,
        run_id: &Uuid,
        step: &StepState,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Get the current step state for (run, step name).
    fn get_step_state(
        &self,
        run_id: &Uuid,
        step_name: &str,
    ) -> impl Future<Output = Result<Option<StepState>, StorageError>> + Send;

    /// Mark the step (and its current attempt) running.
    fn set_step_running(
        &self,
        run_id: &Uuid,
        step_name: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Mark the step (and its current attempt) scheduled.
    fn set_step_scheduled(
        &self,
        run_id: &Uuid,
        step_name: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Record a successful result. Succeeded status is permanent: the step
    /// becomes a cache entry for every later replay.
    fn set_step_result(
        &self,
        run_id: &Uuid,
        step_name: &str,
        result: &Value,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Record a failed attempt's error.
    fn set_step_error(
        &self,
        run_id: &Uuid,
        step_name: &str,
        error: &RunError,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Append a fresh attempt record and reset the step to pending.
    /// Returns the new attempt count.
    fn create_retry_attempt(
        &self,
        run_id: &Uuid,
        step_name: &str,
    ) -> impl Future<Output = Result<u32, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    /// Acquire the run lock, waiting until it is free. Held for the duration
    /// of one orchestrator replay.
    fn lock_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Self::RunLock, StorageError>> + Send;

    /// Acquire the step lock for (run, step name), waiting until it is free.
    /// Held for the duration of one step-worker invocation.
    fn lock_step(
        &self,
        run_id: &Uuid,
        step_name: &str,
    ) -> impl Future<Output = Result<Self::StepLock, StorageError>> + Send;

    /// Release backend resources.
    fn close(&self) -> impl Future<Output = Result<(), StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Graphs
    // -----------------------------------------------------------------------

    /// Completed / terminally-failed / in-flight step names and recorded
    /// branch keys for a run.
    fn graph_snapshot(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<GraphSnapshot, StorageError>> + Send;

    /// Filter `candidates` down to names with no step record in this run.
    fn nodes_without_steps(
        &self,
        run_id: &Uuid,
        candidates: &[String],
    ) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;

    /// Results of the named succeeded steps, keyed by step name.
    fn node_results(
        &self,
        run_id: &Uuid,
        step_names: &[String],
    ) -> impl Future<Output = Result<Map<String, Value>, StorageError>> + Send;

    /// Record the branch key a node chose during execution.
    fn set_branch_taken(
        &self,
        run_id: &Uuid,
        step_name: &str,
        branch: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Store a graph definition under its content hash (idempotent).
    fn upsert_workflow_version(
        &self,
        version: &WorkflowVersion,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Fetch a pinned graph definition by name and hash.
    fn get_workflow_version(
        &self,
        workflow_name: &str,
        graph_hash: &str,
    ) -> impl Future<Output = Result<Option<WorkflowVersion>, StorageError>> + Send;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
