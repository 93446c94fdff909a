//! In-memory `WorkflowStore` implementation.
//!
//! DashMap-backed tables for runs, step state, attempt history, branch keys,
//! and graph versions, plus per-key `tokio::sync::Mutex` lock tables handed
//! out as owned RAII guards. Tokio mutexes queue waiters FIFO, so duplicate
//! deliveries serialize behind the lock and then observe the step state
//! written by the winner.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;
use windlass_core::store::{GraphSnapshot, WorkflowStore};
use windlass_types::error::StorageError;
use windlass_types::graph::WorkflowVersion;
use windlass_types::run::{RunError, RunStatus, WorkflowRun};
use windlass_types::step::{StepAttempt, StepState, StepStatus};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryStore {
    runs: DashMap<Uuid, WorkflowRun>,
    steps: DashMap<(Uuid, String), StepState>,
    /// Append-only attempt history per run, in insertion order.
    attempts: DashMap<Uuid, Vec<StepAttempt>>,
    branches: DashMap<(Uuid, String), String>,
    versions: DashMap<(String, String), WorkflowVersion>,
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    step_locks: DashMap<(Uuid, String), Arc<Mutex<()>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn step_key(run_id: &Uuid, step_name: &str) -> (Uuid, String) {
        (*run_id, step_name.to_string())
    }

    /// Mutate a step state in place, bumping `updated_at`.
    fn with_step<F>(&self, run_id: &Uuid, step_name: &str, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut StepState),
    {
        let key = Self::step_key(run_id, step_name);
        let mut entry = self.steps.get_mut(&key).ok_or(StorageError::NotFound)?;
        f(entry.value_mut());
        entry.value_mut().updated_at = Utc::now();
        Ok(())
    }

    /// Update the newest attempt record for a step.
    fn with_latest_attempt<F>(&self, run_id: &Uuid, step_name: &str, f: F)
    where
        F: FnOnce(&mut StepAttempt),
    {
        if let Some(mut attempts) = self.attempts.get_mut(run_id) {
            if let Some(attempt) = attempts
                .value_mut()
                .iter_mut()
                .rev()
                .find(|a| a.step_name == step_name)
            {
                f(attempt);
            }
        }
    }

    fn append_attempt(&self, run_id: &Uuid, step_name: &str, attempt: u32, status: StepStatus) {
        let record = StepAttempt {
            id: Uuid::now_v7(),
            run_id: *run_id,
            step_name: step_name.to_string(),
            attempt,
            status,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.attempts.entry(*run_id).or_default().push(record);
    }
}

impl WorkflowStore for MemoryStore {
    type RunLock = OwnedMutexGuard<()>;
    type StepLock = OwnedMutexGuard<()>;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), StorageError> {
        if self.runs.contains_key(&run.id) {
            return Err(StorageError::Conflict(format!("run {} exists", run.id)));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, StorageError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn get_run_history(&self, run_id: &Uuid) -> Result<Vec<StepAttempt>, StorageError> {
        Ok(self
            .attempts
            .get(run_id)
            .map(|a| a.value().clone())
            .unwrap_or_default())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        output: Option<&Value>,
        error: Option<&RunError>,
    ) -> Result<(), StorageError> {
        let mut run = self.runs.get_mut(run_id).ok_or(StorageError::NotFound)?;
        let run = run.value_mut();
        run.status = status;
        if let Some(output) = output {
            run.output = Some(output.clone());
        }
        if let Some(error) = error {
            run.error = Some(error.clone());
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn update_run_state(
        &self,
        run_id: &Uuid,
        key: &str,
        value: &Value,
    ) -> Result<(), StorageError> {
        let mut run = self.runs.get_mut(run_id).ok_or(StorageError::NotFound)?;
        run.value_mut().state.insert(key.to_string(), value.clone());
        run.value_mut().updated_at = Utc::now();
        Ok(())
    }

    async fn get_run_state(&self, run_id: &Uuid) -> Result<Map<String, Value>, StorageError> {
        let run = self.runs.get(run_id).ok_or(StorageError::NotFound)?;
        Ok(run.value().state.clone())
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn insert_step_state(&self, run_id: &Uuid, step: &StepState) -> Result<(), StorageError> {
        let key = Self::step_key(run_id, &step.step_name);
        if self.steps.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "step '{}' exists for run {run_id}",
                step.step_name
            )));
        }
        self.steps.insert(key, step.clone());
        self.append_attempt(run_id, &step.step_name, 1, step.status);
        Ok(())
    }

    async fn get_step_state(
        &self,
        run_id: &Uuid,
        step_name: &str,
    ) -> Result<Option<StepState>, StorageError> {
        Ok(self
            .steps
            .get(&Self::step_key(run_id, step_name))
            .map(|s| s.value().clone()))
    }

    async fn set_step_running(&self, run_id: &Uuid, step_name: &str) -> Result<(), StorageError> {
        self.with_step(run_id, step_name, |step| {
            step.status = StepStatus::Running;
        })?;
        self.with_latest_attempt(run_id, step_name, |attempt| {
            attempt.status = StepStatus::Running;
        });
        Ok(())
    }

    async fn set_step_scheduled(&self, run_id: &Uuid, step_name: &str) -> Result<(), StorageError> {
        self.with_step(run_id, step_name, |step| {
            step.status = StepStatus::Scheduled;
        })?;
        self.with_latest_attempt(run_id, step_name, |attempt| {
            attempt.status = StepStatus::Scheduled;
        });
        Ok(())
    }

    async fn set_step_result(
        &self,
        run_id: &Uuid,
        step_name: &str,
        result: &Value,
    ) -> Result<(), StorageError> {
        self.with_step(run_id, step_name, |step| {
            step.status = StepStatus::Succeeded;
            step.result = Some(result.clone());
        })?;
        self.with_latest_attempt(run_id, step_name, |attempt| {
            attempt.status = StepStatus::Succeeded;
            attempt.finished_at = Some(Utc::now());
        });
        Ok(())
    }

    async fn set_step_error(
        &self,
        run_id: &Uuid,
        step_name: &str,
        error: &RunError,
    ) -> Result<(), StorageError> {
        self.with_step(run_id, step_name, |step| {
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
        })?;
        self.with_latest_attempt(run_id, step_name, |attempt| {
            attempt.status = StepStatus::Failed;
            attempt.error = Some(error.clone());
            attempt.finished_at = Some(Utc::now());
        });
        Ok(())
    }

    async fn create_retry_attempt(
        &self,
        run_id: &Uuid,
        step_name: &str,
    ) -> Result<u32, StorageError> {
        let mut next_attempt = 0;
        self.with_step(run_id, step_name, |step| {
            step.attempt_count += 1;
            step.status = StepStatus::Pending;
            next_attempt = step.attempt_count;
        })?;
        self.append_attempt(run_id, step_name, next_attempt, StepStatus::Pending);
        Ok(next_attempt)
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    async fn lock_run(&self, run_id: &Uuid) -> Result<Self::RunLock, StorageError> {
        let mutex = self
            .run_locks
            .entry(*run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        Ok(mutex.lock_owned().await)
    }

    async fn lock_step(&self, run_id: &Uuid, step_name: &str) -> Result<Self::StepLock, StorageError> {
        let mutex = self
            .step_locks
            .entry(Self::step_key(run_id, step_name))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        Ok(mutex.lock_owned().await)
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Graphs
    // -----------------------------------------------------------------------

    async fn graph_snapshot(&self, run_id: &Uuid) -> Result<GraphSnapshot, StorageError> {
        let mut snapshot = GraphSnapshot::default();
        for entry in self.steps.iter() {
            let (id, step_name) = entry.key();
            if id != run_id {
                continue;
            }
            let step = entry.value();
            match step.status {
                StepStatus::Succeeded => snapshot.completed.push(step_name.clone()),
                StepStatus::Failed if step.attempts_exhausted() => {
                    snapshot.failed.push(step_name.clone())
                }
                _ => snapshot.in_flight.push(step_name.clone()),
            }
        }
        snapshot.completed.sort();
        snapshot.failed.sort();
        snapshot.in_flight.sort();

        for entry in self.branches.iter() {
            let (id, step_name) = entry.key();
            if id == run_id {
                snapshot
                    .branches
                    .insert(step_name.clone(), entry.value().clone());
            }
        }

        Ok(snapshot)
    }

    async fn nodes_without_steps(
        &self,
        run_id: &Uuid,
        candidates: &[String],
    ) -> Result<Vec<String>, StorageError> {
        Ok(candidates
            .iter()
            .filter(|name| !self.steps.contains_key(&Self::step_key(run_id, name)))
            .cloned()
            .collect())
    }

    async fn node_results(
        &self,
        run_id: &Uuid,
        step_names: &[String],
    ) -> Result<Map<String, Value>, StorageError> {
        let mut results = Map::new();
        for name in step_names {
            if let Some(step) = self.steps.get(&Self::step_key(run_id, name)) {
                if step.value().status == StepStatus::Succeeded {
                    results.insert(
                        name.clone(),
                        step.value().result.clone().unwrap_or(Value::Null),
                    );
                }
            }
        }
        Ok(results)
    }

    async fn set_branch_taken(
        &self,
        run_id: &Uuid,
        step_name: &str,
        branch: &str,
    ) -> Result<(), StorageError> {
        self.branches
            .insert(Self::step_key(run_id, step_name), branch.to_string());
        Ok(())
    }

    async fn upsert_workflow_version(&self, version: &WorkflowVersion) -> Result<(), StorageError> {
        self.versions.insert(
            (version.workflow_name.clone(), version.graph_hash.clone()),
            version.clone(),
        );
        Ok(())
    }

    async fn get_workflow_version(
        &self,
        workflow_name: &str,
        graph_hash: &str,
    ) -> Result<Option<WorkflowVersion>, StorageError> {
        Ok(self
            .versions
            .get(&(workflow_name.to_string(), graph_hash.to_string()))
            .map(|v| v.value().clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn sample_run() -> WorkflowRun {
        WorkflowRun::new("orders", json!({"orderId": 1}), true)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_run_conflict() {
        let store = MemoryStore::new();
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        assert!(matches!(
            store.create_run(&run).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_run_status_and_state() {
        let store = MemoryStore::new();
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        store
            .update_run_status(&run.id, RunStatus::Completed, Some(&json!({"ok": true})), None)
            .await
            .unwrap();
        store
            .update_run_state(&run.id, "seen", &json!(2))
            .await
            .unwrap();

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.output, Some(json!({"ok": true})));
        assert_eq!(
            store.get_run_state(&run.id).await.unwrap().get("seen"),
            Some(&json!(2))
        );
    }

    // -----------------------------------------------------------------------
    // Steps & attempts
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_step_lifecycle_records_attempts() {
        let store = MemoryStore::new();
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        let step = StepState::new("charge", 2, 100);
        store.insert_step_state(&run.id, &step).await.unwrap();
        assert!(matches!(
            store.insert_step_state(&run.id, &step).await,
            Err(StorageError::Conflict(_))
        ));

        store.set_step_running(&run.id, "charge").await.unwrap();
        store
            .set_step_error(&run.id, "charge", &RunError::new("STEP_FAILED", "declined"))
            .await
            .unwrap();

        let attempt = store.create_retry_attempt(&run.id, "charge").await.unwrap();
        assert_eq!(attempt, 2);

        store.set_step_running(&run.id, "charge").await.unwrap();
        store
            .set_step_result(&run.id, "charge", &json!({"receipt": "r-1"}))
            .await
            .unwrap();

        let state = store
            .get_step_state(&run.id, "charge")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, StepStatus::Succeeded);
        assert_eq!(state.attempt_count, 2);

        let history = store.get_run_history(&run.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, StepStatus::Failed);
        assert!(history[0].error.is_some());
        assert_eq!(history[1].status, StepStatus::Succeeded);
        assert!(history[1].finished_at.is_some());
    }

    // -----------------------------------------------------------------------
    // Graph snapshot
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_graph_snapshot_classification() {
        let store = MemoryStore::new();
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        // Succeeded step.
        store
            .insert_step_state(&run.id, &StepState::new("done", 0, 0))
            .await
            .unwrap();
        store
            .set_step_result(&run.id, "done", &json!(1))
            .await
            .unwrap();

        // Terminally failed step (0 retries).
        store
            .insert_step_state(&run.id, &StepState::new("dead", 0, 0))
            .await
            .unwrap();
        store
            .set_step_error(&run.id, "dead", &RunError::new("STEP_FAILED", "boom"))
            .await
            .unwrap();

        // Failed but retryable: still in flight.
        store
            .insert_step_state(&run.id, &StepState::new("retrying", 2, 0))
            .await
            .unwrap();
        store
            .set_step_error(&run.id, "retrying", &RunError::new("STEP_FAILED", "flaky"))
            .await
            .unwrap();

        store
            .set_branch_taken(&run.id, "done", "true")
            .await
            .unwrap();

        let snapshot = store.graph_snapshot(&run.id).await.unwrap();
        assert_eq!(snapshot.completed, vec!["done".to_string()]);
        assert_eq!(snapshot.failed, vec!["dead".to_string()]);
        assert_eq!(snapshot.in_flight, vec!["retrying".to_string()]);
        assert_eq!(snapshot.branches.get("done").map(String::as_str), Some("true"));

        let fresh = store
            .nodes_without_steps(&run.id, &["done".to_string(), "new".to_string()])
            .await
            .unwrap();
        assert_eq!(fresh, vec!["new".to_string()]);

        let results = store
            .node_results(&run.id, &["done".to_string(), "dead".to_string()])
            .await
            .unwrap();
        assert_eq!(results.get("done"), Some(&json!(1)));
        assert!(!results.contains_key("dead"));
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_lock_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let run_id = Uuid::now_v7();

        let guard = store.lock_run(&run_id).await.unwrap();

        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let _guard = store.lock_run(&run_id).await.unwrap();
            })
        };

        // The contender cannot finish while the guard is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender acquires after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_step_locks_are_independent_per_step() {
        let store = MemoryStore::new();
        let run_id = Uuid::now_v7();

        let _a = store.lock_step(&run_id, "a").await.unwrap();
        // A different step name locks independently.
        let _b = store.lock_step(&run_id, "b").await.unwrap();
    }

    #[tokio::test]
    async fn test_workflow_versions() {
        let store = MemoryStore::new();
        let graph = serde_json::from_value(json!({
            "entry_node_ids": ["a"],
            "nodes": {"a": {"rpc_name": "svc.a"}}
        }))
        .unwrap();
        let version = WorkflowVersion {
            workflow_name: "orders".to_string(),
            graph_hash: "h1".to_string(),
            graph,
            created_at: Utc::now(),
        };

        store.upsert_workflow_version(&version).await.unwrap();
        store.upsert_workflow_version(&version).await.unwrap(); // idempotent

        let stored = store
            .get_workflow_version("orders", "h1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.graph_hash, "h1");
        assert!(store.get_workflow_version("orders", "h2").await.unwrap().is_none());
    }
}
