//! Workflow run types.
//!
//! A `WorkflowRun` is one execution instance of an imperative workflow or a
//! declarative graph. Runs are created once, mutated only through status and
//! state updates, and never deleted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the run has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Run error
// ---------------------------------------------------------------------------

/// Serialized failure attached to a run or step.
///
/// `kind` carries a stable machine code (`GRAPH_NODE_FAILED`,
/// `RPC_NOT_FOUND`, `STEP_FAILED`, `CANCELLED`, ...); `trace` is an optional
/// backtrace or remote stack supplied by the RPC collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RunError {
    /// Create an error with the given machine code and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// Attach a trace to the error.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Workflow run
// ---------------------------------------------------------------------------

/// A single execution instance of a workflow or graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Name of the workflow or graph being executed.
    pub workflow_name: String,
    /// Current run status.
    pub status: RunStatus,
    /// The trigger payload the run was started with.
    pub input: Value,
    /// Final output, set when the run completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure details, set when the run fails or suspends on a topology
    /// error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Free-form run-scoped key/value memory (graph wire `get/set_state`).
    #[serde(default)]
    pub state: Map<String, Value>,
    /// Whether the run executes fully in-process (no queue service).
    pub inline: bool,
    /// Hash of the exact graph definition used, for version pinning.
    /// `None` for imperative (function) workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_hash: Option<String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Create a new running run with the given name and input.
    pub fn new(workflow_name: impl Into<String>, input: Value, inline: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Running,
            input,
            output: None,
            error: None,
            state: Map::new(),
            inline,
            graph_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pin the run to a graph version hash.
    pub fn with_graph_hash(mut self, graph_hash: impl Into<String>) -> Self {
        self.graph_hash = Some(graph_hash.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
