//! Step state, attempt history, and retry configuration.
//!
//! One logical `StepState` exists per (run, step name) pair; every execution
//! attempt is recorded as an immutable `StepAttempt`. The attempt count is
//! derived from history length and strictly increases across retries. A
//! `succeeded` step is a permanent cache entry: replays return its stored
//! result without re-executing the RPC.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::run::RunError;

// ---------------------------------------------------------------------------
// Step status
// ---------------------------------------------------------------------------

/// Status of a logical step (and of each individual attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
}

// ---------------------------------------------------------------------------
// Step state
// ---------------------------------------------------------------------------

/// The current state of a named step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    /// Step name, unique within the run.
    pub step_name: String,
    /// Current status.
    pub status: StepStatus,
    /// Cached result, set once the step succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Last failure, set when an attempt fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Number of attempts recorded so far (history length).
    pub attempt_count: u32,
    /// How many retries are allowed after the first attempt.
    pub retries: u32,
    /// Base delay between retries, in milliseconds.
    pub retry_delay_ms: u64,
    /// When the step state was created.
    pub created_at: DateTime<Utc>,
    /// When the step state was last updated.
    pub updated_at: DateTime<Utc>,
}

impl StepState {
    /// Create a fresh pending step with one attempt about to start.
    pub fn new(step_name: impl Into<String>, retries: u32, retry_delay_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempt_count: 1,
            retries,
            retry_delay_ms,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether every allowed attempt has been consumed.
    ///
    /// A step is allowed `retries + 1` attempts in total.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.retries + 1
    }
}

// ---------------------------------------------------------------------------
// Attempt history
// ---------------------------------------------------------------------------

/// Immutable snapshot of one attempt's lifecycle.
///
/// Appended when a step is created and on every retry; forms the append-only
/// audit trail that `attempt_count` is derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    /// UUIDv7 attempt ID.
    pub id: Uuid,
    /// Parent run ID.
    pub run_id: Uuid,
    /// Step name the attempt belongs to.
    pub step_name: String,
    /// Attempt number (1-based).
    pub attempt: u32,
    /// Final status of this attempt.
    pub status: StepStatus,
    /// Failure details, if the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Backoff shape for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed,
    /// Delay doubles on each retry: `base * 2^(attempt - 1)`.
    Exponential,
}

impl Backoff {
    /// Delay before the given retry attempt (2-based: the first retry is
    /// attempt 2).
    pub fn delay_for_attempt(self, base: Duration, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(2).min(31);
                base.saturating_mul(1u32 << shift)
            }
        }
    }
}

/// Per-step options accepted by the wire `do` primitives.
///
/// `None` fields fall back to the engine defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    /// Retries allowed after the first attempt.
    pub retries: Option<u32>,
    /// Base delay between retries.
    pub retry_delay: Option<Duration>,
    /// Backoff shape (default fixed).
    pub backoff: Option<Backoff>,
}

impl StepOptions {
    /// Options with a retry bound and the default delay/backoff.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries: Some(retries),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_serde() {
        for status in [
            StepStatus::Pending,
            StepStatus::Scheduled,
            StepStatus::Running,
            StepStatus::Succeeded,
            StepStatus::Failed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let parsed: StepStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_attempts_exhausted() {
        let mut step = StepState::new("charge", 2, 1000);
        assert_eq!(step.attempt_count, 1);
        assert!(!step.attempts_exhausted());

        step.attempt_count = 2;
        assert!(!step.attempts_exhausted());

        step.attempt_count = 3;
        assert!(step.attempts_exhausted());
    }

    #[test]
    fn test_zero_retries_exhausts_after_first_attempt() {
        let step = StepState::new("notify", 0, 1000);
        assert!(step.attempts_exhausted());
    }

    #[test]
    fn test_fixed_backoff() {
        let base = Duration::from_millis(500);
        assert_eq!(
            Backoff::Fixed.delay_for_attempt(base, 2),
            Duration::from_millis(500)
        );
        assert_eq!(
            Backoff::Fixed.delay_for_attempt(base, 5),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(
            Backoff::Exponential.delay_for_attempt(base, 2),
            Duration::from_millis(100)
        );
        assert_eq!(
            Backoff::Exponential.delay_for_attempt(base, 3),
            Duration::from_millis(200)
        );
        assert_eq!(
            Backoff::Exponential.delay_for_attempt(base, 4),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_step_state_json_roundtrip() {
        let step = StepState::new("charge", 2, 250);
        let json_str = serde_json::to_string(&step).unwrap();
        let parsed: StepState = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.step_name, "charge");
        assert_eq!(parsed.status, StepStatus::Pending);
        assert_eq!(parsed.retries, 2);
        assert_eq!(parsed.retry_delay_ms, 250);
    }
}
