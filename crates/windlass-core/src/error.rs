//! Engine and graph error taxonomy.
//!
//! Three classes, kept apart deliberately:
//! - configuration errors (unknown workflow/run, dangling graph references,
//!   missing metadata) -- never retried, surfaced at the triggering call;
//! - recoverable business errors -- retried up to the configured bound, then
//!   terminal via run status;
//! - control-flow signals (`Suspended`/`Cancelled`) -- expected outcomes
//!   surfaced as dedicated variants so callers can recognize them without
//!   string matching.

use thiserror::Error;
use uuid::Uuid;
use windlass_types::error::StorageError;
use windlass_types::run::RunError;

use crate::services::{QueueError, RpcError};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No workflow function registered under this name.
    #[error("workflow not found: '{0}'")]
    WorkflowNotFound(String),

    /// No run exists with this id.
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// A queued-mode operation was invoked on an engine without a queue
    /// service.
    #[error("queue service not configured")]
    QueueNotConfigured,

    /// `run_workflow_graph` requires a precomputed graph hash.
    #[error("graph hash is required to start a graph run")]
    MissingGraphHash,

    /// Step names must be non-empty.
    #[error("step name must be a non-empty string")]
    InvalidStepName,

    /// Graph definition or reference validation failure.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Queue collaborator failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The replay reached a step that is awaiting external completion.
    /// An expected outcome, not a failure.
    #[error("run suspended")]
    Suspended,

    /// The run was cancelled from inside the workflow body.
    /// An expected outcome, not a failure.
    #[error("run cancelled")]
    Cancelled,

    /// The run failed with a business error.
    #[error("run failed: {error}")]
    RunFailed { error: RunError },

    /// A step-worker invocation failed; rethrown so the queue layer's
    /// delivery semantics stay accurate.
    #[error("step '{step_name}' failed: {error}")]
    StepFailed { step_name: String, error: RunError },

    /// The RPC collaborator has no handler deployed under this name.
    #[error("rpc not found: '{0}'")]
    RpcNotFound(String),
}

impl EngineError {
    /// Whether this error is a control-flow signal rather than a failure.
    pub fn is_signal(&self) -> bool {
        matches!(self, EngineError::Suspended | EngineError::Cancelled)
    }

    /// Serialize into a run error for persistence.
    pub(crate) fn to_run_error(&self) -> RunError {
        match self {
            EngineError::RunFailed { error } | EngineError::StepFailed { error, .. } => {
                error.clone()
            }
            EngineError::RpcNotFound(name) => RunError::new(
                crate::services::RPC_NOT_FOUND,
                format!("rpc '{name}' not found"),
            ),
            other => RunError::new("ENGINE_ERROR", other.to_string()),
        }
    }
}

impl From<RpcError> for EngineError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::NotFound(name) => EngineError::RpcNotFound(name),
            RpcError::Failed { message, trace } => EngineError::RunFailed {
                error: RunError {
                    kind: crate::signal::STEP_FAILED.to_string(),
                    message,
                    trace,
                },
            },
        }
    }
}

// ---------------------------------------------------------------------------
// GraphError
// ---------------------------------------------------------------------------

/// Graph definition and resolution errors. Configuration-class: validated
/// eagerly before any execution, never retried.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph declares no entry nodes.
    #[error("graph has no entry nodes")]
    NoEntryNodes,

    /// A `next`/`on_error`/entry/input reference points at no declared node.
    #[error("node '{node}' has a dangling {context} reference to '{target}'")]
    DanglingReference {
        node: String,
        context: &'static str,
        target: String,
    },

    /// A runtime step name matches more than one templated node id.
    #[error("step name '{name}' matches multiple node patterns: {candidates:?}")]
    AmbiguousMatch {
        name: String,
        candidates: Vec<String>,
    },

    /// A runtime step name matches no declared node.
    #[error("step name '{0}' matches no declared node")]
    UnknownNode(String),

    /// Input data references must target concrete nodes (or `trigger`);
    /// a templated target has no single result to read.
    #[error("node '{node}' input references templated node '{target}'")]
    TemplatedRef { node: String, target: String },

    /// A reference or template could not be resolved against the available
    /// results at execution time.
    #[error("unresolvable input reference: {0}")]
    Unresolvable(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
