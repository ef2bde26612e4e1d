//! # Ledger Store Abstraction
//!
//! The coordinators never hold authoritative state in memory; every mutation
//! goes through one of these traits against a shared document store. The
//! contract the store must provide:
//!
//! - insert with a unique constraint (idempotent creation, duplicates are
//!   typed errors)
//! - optimistic-version update: write applies only when the caller's
//!   `version` still matches, and bumps it
//! - range scan by an indexed `next_iteration_at` field, ascending
//! - deletion of terminal rows once their validity window lapses
//!
//! Two implementations ship here: [`memory::InMemoryLedgers`] for tests and
//! embedded use, and [`postgres::PgLedgers`] backed by a `sqlx::PgPool`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    BarrierDownReason, BarrierInstance, BarrierState, NewPermitRequest, PermitState,
    ResourceConstraintInstance,
};

/// Outcome of a version-checked write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write applied and the document version advanced
    Applied,
    /// Someone else wrote first; re-read and re-evaluate
    Conflict,
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Persistence operations for the resource-constraint ledger
#[async_trait]
pub trait ConstraintLedger: Send + Sync {
    /// Create a BLOCKED permit request, assigning the next arrival order for
    /// its `(resource_constraint_id, resource_unit)` atomically.
    async fn insert_request(
        &self,
        request: NewPermitRequest,
        ttl: Duration,
    ) -> Result<ResourceConstraintInstance>;

    async fn find_instance(&self, id: Uuid) -> Result<Option<ResourceConstraintInstance>>;

    /// All non-finished rows for one unit, ascending by arrival order
    async fn list_unit(
        &self,
        resource_constraint_id: &str,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>>;

    /// Version-checked state transition. `acquired_at` is stamped when
    /// activating and left untouched otherwise.
    async fn update_instance_state(
        &self,
        id: Uuid,
        expected_version: i64,
        state: PermitState,
        acquired_at: Option<DateTime<Utc>>,
    ) -> Result<CasOutcome>;

    /// Ids of non-finished rows whose `next_iteration_at` has elapsed,
    /// ascending by that field
    async fn due_instances(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>>;

    /// Push the row's next poll time; applied unconditionally (no version
    /// check) so a stuck row still gets rescheduled
    async fn reschedule_instance(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Non-finished requests attributed to one releasing execution, for
    /// operator diagnostics ("what is this execution waiting on")
    async fn instances_for_entity(
        &self,
        release_entity_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>>;

    /// Delete FINISHED rows whose `valid_until` has elapsed; returns the
    /// number removed. Terminal rows are kept until then for diagnostics.
    async fn purge_finished(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Persistence operations for the barrier ledger
#[async_trait]
pub trait BarrierLedger: Send + Sync {
    /// Persist a STANDING barrier; fails with `DuplicateBarrier` when
    /// `(name, execution_id, parallel_index)` already exists
    async fn insert_barrier(&self, barrier: BarrierInstance) -> Result<()>;

    async fn find_barrier(&self, id: Uuid) -> Result<Option<BarrierInstance>>;

    /// Version-checked replacement of the arrived-key set
    async fn update_arrivals(
        &self,
        id: Uuid,
        expected_version: i64,
        arrived_keys: Vec<String>,
    ) -> Result<CasOutcome>;

    /// Version-checked state flip; the exactly-once release point
    async fn update_barrier_state(
        &self,
        id: Uuid,
        expected_version: i64,
        state: BarrierState,
        down_reason: Option<BarrierDownReason>,
    ) -> Result<CasOutcome>;

    /// Ids of standing barriers whose `next_iteration_at` has elapsed
    async fn due_barriers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>>;

    async fn reschedule_barrier(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Standing barriers belonging to one pipeline execution, for operator
    /// diagnostics
    async fn standing_for_execution(&self, execution_id: &str) -> Result<Vec<BarrierInstance>>;

    /// Delete DOWN barriers whose `valid_until` has elapsed; returns the
    /// number removed. Standing barriers are never purged, only expired.
    async fn purge_downed(&self, now: DateTime<Utc>) -> Result<u64>;
}
