//! # Barrier Instance
//!
//! Persisted rendezvous point for the parallel branches of one pipeline
//! execution. The participant list is fixed at creation; each branch signals
//! arrival under its unique workflow key, and the barrier goes DOWN exactly
//! once when the arrived set covers the expected set.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Barrier lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    /// Waiting for participants; branches that poll must re-poll later
    Standing,
    /// Released; terminal, never reverts to standing
    Down,
}

impl BarrierState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Down)
    }
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standing => write!(f, "standing"),
            Self::Down => write!(f, "down"),
        }
    }
}

impl std::str::FromStr for BarrierState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standing" => Ok(Self::Standing),
            "down" => Ok(Self::Down),
            _ => Err(format!("Invalid barrier state: {s}")),
        }
    }
}

/// Why a barrier went down; kept for operator diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierDownReason {
    /// Every expected participant signaled arrival
    AllArrived,
    /// Explicitly cleared, e.g. by pipeline abort
    ForceCleared,
    /// Hard TTL elapsed while still standing (stuck-barrier condition)
    Expired,
}

impl fmt::Display for BarrierDownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllArrived => write!(f, "all_arrived"),
            Self::ForceCleared => write!(f, "force_cleared"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for BarrierDownReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_arrived" => Ok(Self::AllArrived),
            "force_cleared" => Ok(Self::ForceCleared),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid barrier down reason: {s}")),
        }
    }
}

/// One expected participant: a workflow branch inside the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierWorkflow {
    pub pipeline_stage_id: String,
    pub workflow_execution_id: String,
    pub phase_uuid: String,
    pub step_uuid: String,
    pub phase_execution_id: Option<String>,
    pub step_execution_id: Option<String>,
}

impl BarrierWorkflow {
    /// De-duplication key for this participant within its pipeline.
    ///
    /// Stage id plus step uuid: the same workflow template can appear in
    /// several stages, and one stage can hold several barrier steps.
    pub fn unique_workflow_key(&self) -> String {
        format!("{}.{}", self.pipeline_stage_id, self.step_uuid)
    }
}

/// The pipeline-side coordinates of a barrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierPipeline {
    pub execution_id: String,
    /// Disambiguates barriers when a stage is multiplied by a looping or
    /// matrix strategy
    pub parallel_index: i32,
    pub workflows: Vec<BarrierWorkflow>,
}

/// Persisted barrier row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierInstance {
    pub id: Uuid,
    /// Logical barrier name, unique per `(execution_id, parallel_index)`
    pub name: String,
    pub state: BarrierState,
    pub pipeline: BarrierPipeline,
    /// Unique workflow keys that have signaled arrival so far
    pub arrived_keys: Vec<String>,
    pub down_reason: Option<BarrierDownReason>,
    pub created_at: DateTime<Utc>,
    pub next_iteration_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Optimistic concurrency token
    pub version: i64,
}

impl BarrierInstance {
    /// Factory constructor stamping id, timestamps, and poll schedule
    pub fn new_standing(name: impl Into<String>, pipeline: BarrierPipeline, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: BarrierState::Standing,
            pipeline,
            arrived_keys: Vec::new(),
            down_reason: None,
            created_at: now,
            next_iteration_at: now,
            valid_until: now + ttl,
            version: 0,
        }
    }

    /// The fixed set of participant keys expected at this barrier
    pub fn expected_keys(&self) -> HashSet<String> {
        self.pipeline
            .workflows
            .iter()
            .map(BarrierWorkflow::unique_workflow_key)
            .collect()
    }

    /// Participant keys still outstanding (set difference against arrivals)
    pub fn outstanding_keys(&self) -> HashSet<String> {
        let arrived: HashSet<&str> = self.arrived_keys.iter().map(String::as_str).collect();
        self.expected_keys()
            .into_iter()
            .filter(|key| !arrived.contains(key.as_str()))
            .collect()
    }

    /// Whether every expected participant has signaled
    pub fn all_arrived(&self) -> bool {
        self.outstanding_keys().is_empty()
    }

    /// Whether the given key belongs to the fixed participant set
    pub fn expects(&self, participant_key: &str) -> bool {
        self.pipeline
            .workflows
            .iter()
            .any(|w| w.unique_workflow_key() == participant_key)
    }

    /// Whether the hard TTL has elapsed while still standing
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == BarrierState::Standing && now >= self.valid_until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(stage: &str, step: &str) -> BarrierWorkflow {
        BarrierWorkflow {
            pipeline_stage_id: stage.to_string(),
            workflow_execution_id: format!("wf-{stage}"),
            phase_uuid: "phase-1".to_string(),
            step_uuid: step.to_string(),
            phase_execution_id: None,
            step_execution_id: None,
        }
    }

    fn barrier() -> BarrierInstance {
        let pipeline = BarrierPipeline {
            execution_id: "exec-1".to_string(),
            parallel_index: 0,
            workflows: vec![workflow("stage-a", "s1"), workflow("stage-b", "s2")],
        };
        BarrierInstance::new_standing("pre-deploy", pipeline, Duration::hours(1))
    }

    #[test]
    fn unique_workflow_key_combines_stage_and_step() {
        assert_eq!(workflow("stage-a", "s1").unique_workflow_key(), "stage-a.s1");
    }

    #[test]
    fn outstanding_is_set_difference() {
        let mut instance = barrier();
        assert_eq!(instance.outstanding_keys().len(), 2);
        assert!(!instance.all_arrived());

        instance.arrived_keys.push("stage-a.s1".to_string());
        let outstanding = instance.outstanding_keys();
        assert_eq!(outstanding.len(), 1);
        assert!(outstanding.contains("stage-b.s2"));

        instance.arrived_keys.push("stage-b.s2".to_string());
        assert!(instance.all_arrived());
    }

    #[test]
    fn expects_only_fixed_participants() {
        let instance = barrier();
        assert!(instance.expects("stage-a.s1"));
        assert!(!instance.expects("stage-c.s9"));
    }

    #[test]
    fn expiry_requires_standing_state() {
        let mut instance = barrier();
        let later = instance.valid_until + Duration::seconds(1);
        assert!(instance.is_expired(later));

        instance.state = BarrierState::Down;
        assert!(!instance.is_expired(later));
    }
}
