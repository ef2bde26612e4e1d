//! # Resource Constraint Instance
//!
//! One ledger row per outstanding permit *request* against a named resource
//! constraint (a capacity-limited pool shared across unrelated workflow
//! executions). Activation order is strict FIFO by the `order` field, which
//! is unique per `(resource_constraint_id, resource_unit)`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a permit request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermitState {
    /// Waiting for capacity; not yet holding permits
    Blocked,
    /// Holding its permits; counts against the unit's capacity
    Active,
    /// Released or expired; terminal
    Finished,
}

impl PermitState {
    /// Terminal states allow no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Whether this request currently consumes capacity
    pub fn holds_permits(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for PermitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked => write!(f, "blocked"),
            Self::Active => write!(f, "active"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

impl std::str::FromStr for PermitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(Self::Blocked),
            "active" => Ok(Self::Active),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("Invalid permit state: {s}")),
        }
    }
}

/// Persisted permit-request row.
///
/// Owned by the shared store; in-process copies are snapshots and must be
/// re-fetched before mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConstraintInstance {
    pub id: Uuid,
    /// Which named resource pool this request is against
    pub resource_constraint_id: String,
    /// Sub-key partitioning the pool, e.g. per target infrastructure
    pub resource_unit: String,
    /// Arrival sequence, unique per `(resource_constraint_id, resource_unit)`
    pub order: i64,
    pub state: PermitState,
    /// How many units of capacity this request consumes
    pub permits: u32,
    /// Entity type of the requesting execution
    pub release_entity_type: String,
    /// Id of the requesting execution; releases are attributed to it
    pub release_entity_id: String,
    pub created_at: DateTime<Utc>,
    /// Set when the request transitions to ACTIVE
    pub acquired_at: Option<DateTime<Utc>>,
    /// Next time the poller should re-evaluate this row
    pub next_iteration_at: DateTime<Utc>,
    /// Hard expiry safeguard against orphaned requests
    pub valid_until: DateTime<Utc>,
    /// Optimistic concurrency token
    pub version: i64,
}

/// Input for creating a permit request (everything the caller decides)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPermitRequest {
    pub resource_constraint_id: String,
    pub resource_unit: String,
    pub permits: u32,
    pub release_entity_type: String,
    pub release_entity_id: String,
}

impl ResourceConstraintInstance {
    /// Factory constructor stamping id, timestamps, and poll schedule.
    ///
    /// The `order` value must come from the ledger's atomic per-unit
    /// sequence; it is not chosen here.
    pub fn new_request(request: NewPermitRequest, order: i64, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            resource_constraint_id: request.resource_constraint_id,
            resource_unit: request.resource_unit,
            order,
            state: PermitState::Blocked,
            permits: request.permits,
            release_entity_type: request.release_entity_type,
            release_entity_id: request.release_entity_id,
            created_at: now,
            acquired_at: None,
            next_iteration_at: now,
            valid_until: now + ttl,
            version: 0,
        }
    }

    /// Whether the hard TTL has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && now >= self.valid_until
    }
}
