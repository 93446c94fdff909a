//! Engine configuration.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Queue consumed by step workers.
pub const DEFAULT_STEP_QUEUE: &str = "windlass.steps";

/// Queue consumed by the orchestrator.
pub const DEFAULT_ORCHESTRATOR_QUEUE: &str = "windlass.orchestrator";

/// RPC name the scheduler calls back to finish a `sleep` step.
pub const DEFAULT_SLEEP_RPC: &str = "windlass.finishSleep";

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Static engine configuration, set once at initialization.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retries allowed after a step's first attempt when the step options
    /// don't say otherwise.
    pub default_retries: u32,
    /// Base delay between retries when the step options don't say otherwise.
    pub default_retry_delay: Duration,
    /// Name of the queue step-worker jobs are enqueued to.
    pub step_queue: String,
    /// Name of the queue orchestrator continuations are enqueued to.
    pub orchestrator_queue: String,
    /// RPC name used for scheduler sleep callbacks.
    pub sleep_rpc: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retries: 0,
            default_retry_delay: Duration::from_secs(1),
            step_queue: DEFAULT_STEP_QUEUE.to_string(),
            orchestrator_queue: DEFAULT_ORCHESTRATOR_QUEUE.to_string(),
            sleep_rpc: DEFAULT_SLEEP_RPC.to_string(),
        }
    }
}
