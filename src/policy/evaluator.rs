//! # Failure/Retry Policy Evaluator
//!
//! Maps a failure event plus the workflow's configured strategies to a
//! disposition. Selection is first-match: the first strategy whose failure
//! types intersect the event's type and whose step scope covers the failing
//! step is applied. No match defaults to [`Disposition::Fail`] so the
//! executor's control flow stays total.
//!
//! Retry accounting is stateless per call. The caller supplies `attempt`,
//! the 0-based count of retries already consumed: attempts
//! `0..retry_count-1` return RETRY with `retry_intervals[min(attempt, len-1)]`,
//! attempt `retry_count` and beyond fall back to
//! `repair_action_code_after_retry`.

use chrono::Duration;

use crate::models::{FailureStrategy, FailureType, RepairActionCode};

/// A step failure reported by the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    pub failure_type: FailureType,
    pub step_name: String,
    /// Retries already consumed for this step (0 on the first failure)
    pub attempt: u32,
    /// Failed instance count for multi-instance steps; 1 for plain steps
    pub failed_instances: u32,
    /// Total instance count for multi-instance steps; 1 for plain steps
    pub total_instances: u32,
}

impl FailureEvent {
    /// A single-instance failure with no retries consumed yet
    pub fn new(failure_type: FailureType, step_name: impl Into<String>) -> Self {
        Self {
            failure_type,
            step_name: step_name.into(),
            attempt: 0,
            failed_instances: 1,
            total_instances: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_instances(mut self, failed: u32, total: u32) -> Self {
        self.failed_instances = failed;
        self.total_instances = total;
        self
    }

    /// Percentage comparison without floating point: failed/total*100 >= threshold
    fn meets_threshold(&self, threshold_percentage: u8) -> bool {
        if self.total_instances == 0 {
            return true;
        }
        u64::from(self.failed_instances) * 100
            >= u64::from(threshold_percentage) * u64::from(self.total_instances)
    }
}

/// Outcome of evaluating a failure against policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Tolerate the failure and keep going
    Continue,
    /// Re-run the failing step after the given delay
    Retry { delay: Duration },
    /// Suspend for manual action; `on_timeout` applies when the window
    /// expires (handled by the advisor, not here)
    Pause {
        timeout: Option<Duration>,
        on_timeout: RepairActionCode,
    },
    /// Fail the whole execution
    Fail,
    /// Mark the step failed but leave the execution running
    MarkFailed,
}

/// Evaluate a failure event against the configured strategies.
///
/// Total: always returns a disposition, never errors.
pub fn decide(event: &FailureEvent, strategies: &[FailureStrategy]) -> Disposition {
    let selected = strategies.iter().find(|strategy| {
        strategy.matches_failure(event.failure_type) && strategy.applies_to_step(&event.step_name)
    });

    let Some(strategy) = selected else {
        return Disposition::Fail;
    };

    // An aggregate threshold below the configured trigger means the failure
    // is tolerated, not escalated to the next strategy.
    if let Some(criteria) = &strategy.failure_criteria {
        if !event.meets_threshold(criteria.failure_threshold_percentage) {
            return Disposition::Continue;
        }
    }

    apply_action(strategy.repair_action_code, event, strategy)
}

fn apply_action(
    action: RepairActionCode,
    event: &FailureEvent,
    strategy: &FailureStrategy,
) -> Disposition {
    match action {
        RepairActionCode::Retry => {
            if event.attempt < strategy.retry_count {
                Disposition::Retry {
                    delay: strategy.retry_interval_for(event.attempt),
                }
            } else {
                fallback_action(strategy.repair_action_code_after_retry, event, strategy)
            }
        }
        RepairActionCode::Ignore => Disposition::Continue,
        RepairActionCode::ManualIntervention => Disposition::Pause {
            timeout: strategy.manual_intervention_timeout,
            on_timeout: strategy
                .action_after_timeout
                .unwrap_or(RepairActionCode::EndExecution),
        },
        RepairActionCode::MarkStepFailed => Disposition::MarkFailed,
        RepairActionCode::EndExecution | RepairActionCode::RollbackWorkflow => Disposition::Fail,
    }
}

/// Post-exhaustion action. A fallback of RETRY would loop forever, so it
/// degrades to FAIL.
fn fallback_action(
    action: RepairActionCode,
    event: &FailureEvent,
    strategy: &FailureStrategy,
) -> Disposition {
    match action {
        RepairActionCode::Retry => Disposition::Fail,
        other => apply_action(other, event, strategy),
    }
}
