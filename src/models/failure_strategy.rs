//! # Failure Strategy
//!
//! Immutable failure-handling policy authored as part of a workflow
//! definition. The coordination core only evaluates these documents; it
//! never mutates them. See [`crate::policy::evaluator`] for the selection
//! and retry-accounting rules.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Failure categories a strategy can match on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    ApplicationError,
    TimeoutError,
    ConnectivityError,
    AuthenticationError,
    VerificationFailure,
    Expired,
}

/// Repair actions a strategy can prescribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairActionCode {
    /// Re-run the failing step, subject to retry accounting
    Retry,
    /// Treat the failure as success and continue
    Ignore,
    /// Pause the execution and wait for an operator
    ManualIntervention,
    /// Mark the step failed but leave the execution running
    MarkStepFailed,
    /// Fail the whole execution
    EndExecution,
    /// Roll back; the executor owns the rollback graph, the coordinator
    /// reports it as a terminal failure of the forward path
    RollbackWorkflow,
}

/// Aggregate-failure trigger for multi-instance steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCriteria {
    /// Percentage of failed instances (0-100) at or above which the
    /// strategy applies
    pub failure_threshold_percentage: u8,
}

/// One failure-handling rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureStrategy {
    /// Failure categories this rule matches; empty matches nothing
    pub failure_types: Vec<FailureType>,
    /// Step names this rule is scoped to; empty means all steps
    #[serde(default)]
    pub specific_steps: Vec<String>,
    pub repair_action_code: RepairActionCode,
    #[serde(default)]
    pub retry_count: u32,
    /// Ordered backoff delays in milliseconds; the last entry repeats once
    /// the list is exhausted
    #[serde(default, with = "duration_millis_vec")]
    pub retry_intervals: Vec<Duration>,
    /// Fallback action once retries exhaust
    pub repair_action_code_after_retry: RepairActionCode,
    #[serde(default)]
    pub failure_criteria: Option<FailureCriteria>,
    #[serde(default, with = "duration_millis_opt")]
    pub manual_intervention_timeout: Option<Duration>,
    /// Action applied when the manual-intervention window expires
    #[serde(default)]
    pub action_after_timeout: Option<RepairActionCode>,
}

impl FailureStrategy {
    /// Validate the policy invariants before it is consumed.
    pub fn validate(&self) -> Result<()> {
        if let Some(criteria) = &self.failure_criteria {
            if criteria.failure_threshold_percentage > 100 {
                return Err(CoordinationError::Validation {
                    field: "failure_criteria.failure_threshold_percentage".to_string(),
                    reason: format!(
                        "must be between 0 and 100, got {}",
                        criteria.failure_threshold_percentage
                    ),
                });
            }
        }
        if self.repair_action_code == RepairActionCode::Retry
            && self.retry_count > 1
            && self.retry_intervals.is_empty()
        {
            return Err(CoordinationError::Validation {
                field: "retry_intervals".to_string(),
                reason: "must be non-empty when repair_action_code is retry with retry_count > 1"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Whether this rule is scoped to the given step
    pub fn applies_to_step(&self, step_name: &str) -> bool {
        self.specific_steps.is_empty() || self.specific_steps.iter().any(|s| s == step_name)
    }

    /// Whether this rule matches the given failure category
    pub fn matches_failure(&self, failure_type: FailureType) -> bool {
        self.failure_types.contains(&failure_type)
    }

    /// Backoff delay for the given 0-based attempt; the last interval
    /// repeats when the list is shorter than the retry budget.
    pub fn retry_interval_for(&self, attempt: u32) -> Duration {
        if self.retry_intervals.is_empty() {
            return Duration::zero();
        }
        let index = (attempt as usize).min(self.retry_intervals.len() - 1);
        self.retry_intervals[index]
    }
}

mod duration_millis_vec {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter().map(Duration::num_milliseconds))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        let millis = Vec::<i64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::milliseconds).collect())
    }
}

mod duration_millis_opt {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.num_milliseconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<i64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::milliseconds))
    }
}
