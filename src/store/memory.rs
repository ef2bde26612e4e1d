//! # In-Memory Ledgers
//!
//! Process-local implementation of both ledger traits. Used by the test
//! suites and by embedded single-process deployments; the semantics
//! (unique constraints, version-checked writes, due scans) mirror the
//! Postgres implementation exactly so coordinator logic cannot tell them
//! apart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{CoordinationError, Result};
use crate::models::{
    BarrierDownReason, BarrierInstance, BarrierState, NewPermitRequest, PermitState,
    ResourceConstraintInstance,
};
use crate::store::{BarrierLedger, CasOutcome, ConstraintLedger};

/// In-memory backing for both ledgers
#[derive(Default)]
pub struct InMemoryLedgers {
    constraints: RwLock<HashMap<Uuid, ResourceConstraintInstance>>,
    barriers: RwLock<HashMap<Uuid, BarrierInstance>>,
    /// Last assigned arrival order per `(resource_constraint_id, resource_unit)`
    order_sequences: DashMap<(String, String), i64>,
}

impl InMemoryLedgers {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_order(&self, resource_constraint_id: &str, resource_unit: &str) -> i64 {
        let mut entry = self
            .order_sequences
            .entry((
                resource_constraint_id.to_string(),
                resource_unit.to_string(),
            ))
            .or_insert(0);
        *entry += 1;
        *entry
    }
}

#[async_trait]
impl ConstraintLedger for InMemoryLedgers {
    async fn insert_request(
        &self,
        request: NewPermitRequest,
        ttl: Duration,
    ) -> Result<ResourceConstraintInstance> {
        let order = self.next_order(&request.resource_constraint_id, &request.resource_unit);
        let instance = ResourceConstraintInstance::new_request(request, order, ttl);
        self.constraints
            .write()
            .insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn find_instance(&self, id: Uuid) -> Result<Option<ResourceConstraintInstance>> {
        Ok(self.constraints.read().get(&id).cloned())
    }

    async fn list_unit(
        &self,
        resource_constraint_id: &str,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let mut rows: Vec<_> = self
            .constraints
            .read()
            .values()
            .filter(|row| {
                row.resource_constraint_id == resource_constraint_id
                    && row.resource_unit == resource_unit
                    && row.state != PermitState::Finished
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.order);
        Ok(rows)
    }

    async fn update_instance_state(
        &self,
        id: Uuid,
        expected_version: i64,
        state: PermitState,
        acquired_at: Option<DateTime<Utc>>,
    ) -> Result<CasOutcome> {
        let mut guard = self.constraints.write();
        let row = guard
            .get_mut(&id)
            .ok_or(CoordinationError::PermitNotFound { instance_id: id })?;
        if row.version != expected_version {
            return Ok(CasOutcome::Conflict);
        }
        row.state = state;
        if let Some(at) = acquired_at {
            row.acquired_at = Some(at);
        }
        row.version += 1;
        Ok(CasOutcome::Applied)
    }

    async fn due_instances(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let mut due: Vec<_> = self
            .constraints
            .read()
            .values()
            .filter(|row| row.state != PermitState::Finished && row.next_iteration_at <= now)
            .map(|row| (row.next_iteration_at, row.id))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn reschedule_instance(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(row) = self.constraints.write().get_mut(&id) {
            row.next_iteration_at = at;
        }
        Ok(())
    }

    async fn instances_for_entity(
        &self,
        release_entity_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let mut rows: Vec<_> = self
            .constraints
            .read()
            .values()
            .filter(|row| {
                row.release_entity_id == release_entity_id && row.state != PermitState::Finished
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.order);
        Ok(rows)
    }

    async fn purge_finished(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.constraints.write();
        let before = guard.len();
        guard.retain(|_, row| !(row.state == PermitState::Finished && row.valid_until <= now));
        Ok((before - guard.len()) as u64)
    }
}

#[async_trait]
impl BarrierLedger for InMemoryLedgers {
    async fn insert_barrier(&self, barrier: BarrierInstance) -> Result<()> {
        let mut guard = self.barriers.write();
        let duplicate = guard.values().any(|existing| {
            existing.name == barrier.name
                && existing.pipeline.execution_id == barrier.pipeline.execution_id
                && existing.pipeline.parallel_index == barrier.pipeline.parallel_index
        });
        if duplicate {
            return Err(CoordinationError::DuplicateBarrier {
                name: barrier.name,
                execution_id: barrier.pipeline.execution_id,
                parallel_index: barrier.pipeline.parallel_index,
            });
        }
        guard.insert(barrier.id, barrier);
        Ok(())
    }

    async fn find_barrier(&self, id: Uuid) -> Result<Option<BarrierInstance>> {
        Ok(self.barriers.read().get(&id).cloned())
    }

    async fn update_arrivals(
        &self,
        id: Uuid,
        expected_version: i64,
        arrived_keys: Vec<String>,
    ) -> Result<CasOutcome> {
        let mut guard = self.barriers.write();
        let row = guard
            .get_mut(&id)
            .ok_or(CoordinationError::BarrierNotFound { barrier_id: id })?;
        if row.version != expected_version {
            return Ok(CasOutcome::Conflict);
        }
        row.arrived_keys = arrived_keys;
        row.version += 1;
        Ok(CasOutcome::Applied)
    }

    async fn update_barrier_state(
        &self,
        id: Uuid,
        expected_version: i64,
        state: BarrierState,
        down_reason: Option<BarrierDownReason>,
    ) -> Result<CasOutcome> {
        let mut guard = self.barriers.write();
        let row = guard
            .get_mut(&id)
            .ok_or(CoordinationError::BarrierNotFound { barrier_id: id })?;
        if row.version != expected_version {
            return Ok(CasOutcome::Conflict);
        }
        row.state = state;
        row.down_reason = down_reason;
        row.version += 1;
        Ok(CasOutcome::Applied)
    }

    async fn due_barriers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let mut due: Vec<_> = self
            .barriers
            .read()
            .values()
            .filter(|row| row.state == BarrierState::Standing && row.next_iteration_at <= now)
            .map(|row| (row.next_iteration_at, row.id))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn reschedule_barrier(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(row) = self.barriers.write().get_mut(&id) {
            row.next_iteration_at = at;
        }
        Ok(())
    }

    async fn standing_for_execution(&self, execution_id: &str) -> Result<Vec<BarrierInstance>> {
        let mut rows: Vec<_> = self
            .barriers
            .read()
            .values()
            .filter(|row| {
                row.state == BarrierState::Standing && row.pipeline.execution_id == execution_id
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn purge_downed(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.barriers.write();
        let before = guard.len();
        guard.retain(|_, row| !(row.state == BarrierState::Down && row.valid_until <= now));
        Ok((before - guard.len()) as u64)
    }
}
