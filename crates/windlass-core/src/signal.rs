//! Control-flow signals for workflow function bodies.
//!
//! Suspension and cancellation are expected outcomes, not failures. They are
//! modeled as a tagged type that wire primitives return in the error
//! position of a `Result`, so `?` inside a workflow function propagates the
//! signal past business logic to the orchestrator, which pattern-matches on
//! it instead of treating it as an error.

use windlass_types::run::RunError;

/// Error code used for business failures raised through [`FlowSignal::fail`].
pub const STEP_FAILED: &str = "STEP_FAILED";

/// Error code recorded when a run is cancelled.
pub const CANCELLED: &str = "CANCELLED";

// ---------------------------------------------------------------------------
// FlowSignal
// ---------------------------------------------------------------------------

/// Non-local outcome of a wire primitive inside a workflow function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowSignal {
    /// Pause this run; an external completion will resume it later.
    Suspend,
    /// The run was cancelled from inside the workflow body.
    Cancel,
    /// A genuine business failure; the orchestrator marks the run failed.
    Fail(RunError),
}

impl FlowSignal {
    /// Build a failure signal with the standard step-failure code.
    pub fn fail(message: impl Into<String>) -> Self {
        FlowSignal::Fail(RunError::new(STEP_FAILED, message))
    }

    /// Whether this signal is a pause rather than a terminal outcome.
    pub fn is_suspend(&self) -> bool {
        matches!(self, FlowSignal::Suspend)
    }
}

impl From<RunError> for FlowSignal {
    fn from(error: RunError) -> Self {
        FlowSignal::Fail(error)
    }
}

impl std::fmt::Display for FlowSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowSignal::Suspend => write!(f, "suspended"),
            FlowSignal::Cancel => write!(f, "cancelled"),
            FlowSignal::Fail(err) => write!(f, "failed: {err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
