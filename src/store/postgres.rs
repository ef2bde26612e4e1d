//! # Postgres Ledgers
//!
//! `sqlx::PgPool`-backed implementation of both ledger traits. Queries are
//! runtime-checked (`sqlx::query_as::<_, Row>`) so the crate builds without a
//! live database. Uniqueness invariants live in database unique indexes;
//! optimistic concurrency is a version-guarded UPDATE.
//!
//! The arrival-order sequence uses an upsert against a per-unit counter row
//! (`RETURNING last_order`), which is atomic under concurrent requesters
//! without table locks.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{CoordinationError, Result};
use crate::models::{
    BarrierDownReason, BarrierInstance, BarrierPipeline, BarrierState, BarrierWorkflow,
    NewPermitRequest, PermitState, ResourceConstraintInstance,
};
use crate::store::{BarrierLedger, CasOutcome, ConstraintLedger};

/// Idempotent schema for both ledgers plus the order-sequence table
const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS resource_constraint_instances (
    id UUID PRIMARY KEY,
    resource_constraint_id TEXT NOT NULL,
    resource_unit TEXT NOT NULL,
    arrival_order BIGINT NOT NULL,
    state TEXT NOT NULL,
    permits INTEGER NOT NULL,
    release_entity_type TEXT NOT NULL,
    release_entity_id TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    acquired_at TIMESTAMPTZ,
    next_iteration_at TIMESTAMPTZ NOT NULL,
    valid_until TIMESTAMPTZ NOT NULL,
    version BIGINT NOT NULL DEFAULT 0,
    UNIQUE (resource_constraint_id, resource_unit, arrival_order)
);

CREATE INDEX IF NOT EXISTS idx_rci_next_iteration
    ON resource_constraint_instances (next_iteration_at)
    WHERE state <> 'finished';

CREATE INDEX IF NOT EXISTS idx_rci_release_entity
    ON resource_constraint_instances (release_entity_id)
    WHERE state <> 'finished';

CREATE TABLE IF NOT EXISTS resource_constraint_sequences (
    resource_constraint_id TEXT NOT NULL,
    resource_unit TEXT NOT NULL,
    last_order BIGINT NOT NULL,
    PRIMARY KEY (resource_constraint_id, resource_unit)
);

CREATE TABLE IF NOT EXISTS barrier_instances (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    execution_id TEXT NOT NULL,
    parallel_index INTEGER NOT NULL,
    workflows JSONB NOT NULL,
    arrived_keys TEXT[] NOT NULL DEFAULT '{}',
    down_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    next_iteration_at TIMESTAMPTZ NOT NULL,
    valid_until TIMESTAMPTZ NOT NULL,
    version BIGINT NOT NULL DEFAULT 0,
    UNIQUE (name, execution_id, parallel_index)
);

CREATE INDEX IF NOT EXISTS idx_barrier_next_iteration
    ON barrier_instances (next_iteration_at)
    WHERE state = 'standing';
"#;

/// Postgres-backed ledgers
#[derive(Clone)]
pub struct PgLedgers {
    pool: PgPool,
}

impl PgLedgers {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the ledger schema; safe to call on every startup
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_DDL)
            .execute(&self.pool)
            .await
            .map_err(|e| CoordinationError::storage("ensure_schema", e))?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct ConstraintRow {
    id: Uuid,
    resource_constraint_id: String,
    resource_unit: String,
    arrival_order: i64,
    state: String,
    permits: i32,
    release_entity_type: String,
    release_entity_id: String,
    created_at: DateTime<Utc>,
    acquired_at: Option<DateTime<Utc>>,
    next_iteration_at: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    version: i64,
}

impl ConstraintRow {
    fn into_instance(self) -> Result<ResourceConstraintInstance> {
        let state = self
            .state
            .parse::<PermitState>()
            .map_err(|reason| CoordinationError::Validation {
                field: "resource_constraint_instances.state".to_string(),
                reason,
            })?;
        Ok(ResourceConstraintInstance {
            id: self.id,
            resource_constraint_id: self.resource_constraint_id,
            resource_unit: self.resource_unit,
            order: self.arrival_order,
            state,
            permits: self.permits as u32,
            release_entity_type: self.release_entity_type,
            release_entity_id: self.release_entity_id,
            created_at: self.created_at,
            acquired_at: self.acquired_at,
            next_iteration_at: self.next_iteration_at,
            valid_until: self.valid_until,
            version: self.version,
        })
    }
}

const CONSTRAINT_COLUMNS: &str = "id, resource_constraint_id, resource_unit, arrival_order, \
     state, permits, release_entity_type, release_entity_id, created_at, acquired_at, \
     next_iteration_at, valid_until, version";

#[async_trait]
impl ConstraintLedger for PgLedgers {
    async fn insert_request(
        &self,
        request: NewPermitRequest,
        ttl: Duration,
    ) -> Result<ResourceConstraintInstance> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoordinationError::storage("insert_request.begin", e))?;

        let (order,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO resource_constraint_sequences (resource_constraint_id, resource_unit, last_order)
            VALUES ($1, $2, 1)
            ON CONFLICT (resource_constraint_id, resource_unit)
            DO UPDATE SET last_order = resource_constraint_sequences.last_order + 1
            RETURNING last_order
            "#,
        )
        .bind(&request.resource_constraint_id)
        .bind(&request.resource_unit)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| CoordinationError::storage("insert_request.next_order", e))?;

        let instance = ResourceConstraintInstance::new_request(request, order, ttl);

        sqlx::query(
            r#"
            INSERT INTO resource_constraint_instances
                (id, resource_constraint_id, resource_unit, arrival_order, state, permits,
                 release_entity_type, release_entity_id, created_at, acquired_at,
                 next_iteration_at, valid_until, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.resource_constraint_id)
        .bind(&instance.resource_unit)
        .bind(instance.order)
        .bind(instance.state.to_string())
        .bind(instance.permits as i32)
        .bind(&instance.release_entity_type)
        .bind(&instance.release_entity_id)
        .bind(instance.created_at)
        .bind(instance.acquired_at)
        .bind(instance.next_iteration_at)
        .bind(instance.valid_until)
        .bind(instance.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoordinationError::storage("insert_request.insert", e))?;

        tx.commit()
            .await
            .map_err(|e| CoordinationError::storage("insert_request.commit", e))?;

        Ok(instance)
    }

    async fn find_instance(&self, id: Uuid) -> Result<Option<ResourceConstraintInstance>> {
        let query = format!(
            "SELECT {CONSTRAINT_COLUMNS} FROM resource_constraint_instances WHERE id = $1"
        );
        let row = sqlx::query_as::<_, ConstraintRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoordinationError::storage("find_instance", e))?;
        row.map(ConstraintRow::into_instance).transpose()
    }

    async fn list_unit(
        &self,
        resource_constraint_id: &str,
        resource_unit: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let query = format!(
            r#"
            SELECT {CONSTRAINT_COLUMNS} FROM resource_constraint_instances
            WHERE resource_constraint_id = $1 AND resource_unit = $2 AND state <> 'finished'
            ORDER BY arrival_order ASC
            "#
        );
        let rows = sqlx::query_as::<_, ConstraintRow>(&query)
            .bind(resource_constraint_id)
            .bind(resource_unit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoordinationError::storage("list_unit", e))?;
        rows.into_iter().map(ConstraintRow::into_instance).collect()
    }

    async fn update_instance_state(
        &self,
        id: Uuid,
        expected_version: i64,
        state: PermitState,
        acquired_at: Option<DateTime<Utc>>,
    ) -> Result<CasOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE resource_constraint_instances
            SET state = $3,
                acquired_at = COALESCE($4, acquired_at),
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(state.to_string())
        .bind(acquired_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoordinationError::storage("update_instance_state", e))?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn due_instances(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM resource_constraint_instances
            WHERE state <> 'finished' AND next_iteration_at <= $1
            ORDER BY next_iteration_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoordinationError::storage("due_instances", e))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn reschedule_instance(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE resource_constraint_instances SET next_iteration_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| CoordinationError::storage("reschedule_instance", e))?;
        Ok(())
    }

    async fn instances_for_entity(
        &self,
        release_entity_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        let query = format!(
            r#"
            SELECT {CONSTRAINT_COLUMNS} FROM resource_constraint_instances
            WHERE release_entity_id = $1 AND state <> 'finished'
            ORDER BY arrival_order ASC
            "#
        );
        let rows = sqlx::query_as::<_, ConstraintRow>(&query)
            .bind(release_entity_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoordinationError::storage("instances_for_entity", e))?;
        rows.into_iter().map(ConstraintRow::into_instance).collect()
    }

    async fn purge_finished(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM resource_constraint_instances WHERE state = 'finished' AND valid_until <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoordinationError::storage("purge_finished", e))?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct BarrierRow {
    id: Uuid,
    name: String,
    state: String,
    execution_id: String,
    parallel_index: i32,
    workflows: Json<Vec<BarrierWorkflow>>,
    arrived_keys: Vec<String>,
    down_reason: Option<String>,
    created_at: DateTime<Utc>,
    next_iteration_at: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    version: i64,
}

impl BarrierRow {
    fn into_instance(self) -> Result<BarrierInstance> {
        let state = self
            .state
            .parse::<BarrierState>()
            .map_err(|reason| CoordinationError::Validation {
                field: "barrier_instances.state".to_string(),
                reason,
            })?;
        let down_reason = self
            .down_reason
            .map(|raw| raw.parse::<BarrierDownReason>())
            .transpose()
            .map_err(|reason| CoordinationError::Validation {
                field: "barrier_instances.down_reason".to_string(),
                reason,
            })?;
        Ok(BarrierInstance {
            id: self.id,
            name: self.name,
            state,
            pipeline: BarrierPipeline {
                execution_id: self.execution_id,
                parallel_index: self.parallel_index,
                workflows: self.workflows.0,
            },
            arrived_keys: self.arrived_keys,
            down_reason,
            created_at: self.created_at,
            next_iteration_at: self.next_iteration_at,
            valid_until: self.valid_until,
            version: self.version,
        })
    }
}

const BARRIER_COLUMNS: &str = "id, name, state, execution_id, parallel_index, workflows, \
     arrived_keys, down_reason, created_at, next_iteration_at, valid_until, version";

#[async_trait]
impl BarrierLedger for PgLedgers {
    async fn insert_barrier(&self, barrier: BarrierInstance) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO barrier_instances
                (id, name, state, execution_id, parallel_index, workflows, arrived_keys,
                 down_reason, created_at, next_iteration_at, valid_until, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(barrier.id)
        .bind(&barrier.name)
        .bind(barrier.state.to_string())
        .bind(&barrier.pipeline.execution_id)
        .bind(barrier.pipeline.parallel_index)
        .bind(Json(&barrier.pipeline.workflows))
        .bind(&barrier.arrived_keys)
        .bind(barrier.down_reason.map(|r| r.to_string()))
        .bind(barrier.created_at)
        .bind(barrier.next_iteration_at)
        .bind(barrier.valid_until)
        .bind(barrier.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(CoordinationError::DuplicateBarrier {
                    name: barrier.name,
                    execution_id: barrier.pipeline.execution_id,
                    parallel_index: barrier.pipeline.parallel_index,
                })
            }
            Err(e) => Err(CoordinationError::storage("insert_barrier", e)),
        }
    }

    async fn find_barrier(&self, id: Uuid) -> Result<Option<BarrierInstance>> {
        let query = format!("SELECT {BARRIER_COLUMNS} FROM barrier_instances WHERE id = $1");
        let row = sqlx::query_as::<_, BarrierRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoordinationError::storage("find_barrier", e))?;
        row.map(BarrierRow::into_instance).transpose()
    }

    async fn update_arrivals(
        &self,
        id: Uuid,
        expected_version: i64,
        arrived_keys: Vec<String>,
    ) -> Result<CasOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE barrier_instances
            SET arrived_keys = $3, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(&arrived_keys)
        .execute(&self.pool)
        .await
        .map_err(|e| CoordinationError::storage("update_arrivals", e))?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn update_barrier_state(
        &self,
        id: Uuid,
        expected_version: i64,
        state: BarrierState,
        down_reason: Option<BarrierDownReason>,
    ) -> Result<CasOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE barrier_instances
            SET state = $3, down_reason = $4, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(state.to_string())
        .bind(down_reason.map(|r| r.to_string()))
        .execute(&self.pool)
        .await
        .map_err(|e| CoordinationError::storage("update_barrier_state", e))?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn due_barriers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM barrier_instances
            WHERE state = 'standing' AND next_iteration_at <= $1
            ORDER BY next_iteration_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoordinationError::storage("due_barriers", e))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn reschedule_barrier(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE barrier_instances SET next_iteration_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| CoordinationError::storage("reschedule_barrier", e))?;
        Ok(())
    }

    async fn standing_for_execution(&self, execution_id: &str) -> Result<Vec<BarrierInstance>> {
        let query = format!(
            r#"
            SELECT {BARRIER_COLUMNS} FROM barrier_instances
            WHERE execution_id = $1 AND state = 'standing'
            ORDER BY created_at ASC
            "#
        );
        let rows = sqlx::query_as::<_, BarrierRow>(&query)
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoordinationError::storage("standing_for_execution", e))?;
        rows.into_iter().map(BarrierRow::into_instance).collect()
    }

    async fn purge_downed(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM barrier_instances WHERE state = 'down' AND valid_until <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoordinationError::storage("purge_downed", e))?;
        Ok(result.rows_affected())
    }
}
