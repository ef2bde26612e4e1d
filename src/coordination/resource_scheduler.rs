//! # Resource Constraint Scheduler
//!
//! Enforces a maximum concurrency per named resource unit across unrelated
//! executions: a distributed semaphore with strict FIFO ordering. Requests
//! are ledger rows; activation walks BLOCKED rows in arrival order and stops
//! at the first row that would exceed capacity, so a large request is never
//! skipped over by later smaller ones.
//!
//! `request_permit` is non-blocking: the caller gets an instance id back
//! immediately and polls [`ResourceScheduler::is_active`] (directly or via
//! the advisor) until capacity is granted. Re-evaluation is idempotent and
//! safe under concurrent schedulers; races are resolved by per-row
//! optimistic writes, with the loser re-reading and re-evaluating.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::constants::events;
use crate::coordination::poller::IterationHandler;
use crate::coordination::ExecutionContext;
use crate::error::{CoordinationError, Result};
use crate::models::{NewPermitRequest, PermitState, ResourceConstraintInstance};
use crate::store::{CasOutcome, ConstraintLedger};

/// What one re-evaluation pass did to a unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationSummary {
    /// Requests that transitioned BLOCKED -> ACTIVE this pass
    pub activated: Vec<Uuid>,
    /// Requests force-finished because their TTL elapsed
    pub expired: Vec<Uuid>,
    /// Permits held by ACTIVE rows after the pass
    pub active_permits: u32,
    /// Configured capacity of the unit
    pub capacity: u32,
}

/// FIFO capacity scheduler over the resource-constraint ledger
pub struct ResourceScheduler {
    ledger: Arc<dyn ConstraintLedger>,
    config: Arc<CoordinationConfig>,
}

impl ResourceScheduler {
    pub fn new(ledger: Arc<dyn ConstraintLedger>, config: Arc<CoordinationConfig>) -> Self {
        Self { ledger, config }
    }

    /// Configured per-unit capacity; missing configuration is a caller error
    pub fn capacity_for(&self, resource_constraint_id: &str) -> Result<u32> {
        self.config.capacity_for(resource_constraint_id).ok_or_else(|| {
            CoordinationError::UnknownResourceConstraint {
                resource_constraint_id: resource_constraint_id.to_string(),
            }
        })
    }

    /// Create a BLOCKED permit request and return its id immediately.
    ///
    /// The caller does not wait: it polls `is_active` until the scheduler
    /// grants capacity. A request that could never fit is rejected here
    /// rather than admitted as a row that would starve forever.
    pub async fn request_permit(
        &self,
        ctx: &ExecutionContext,
        request: NewPermitRequest,
    ) -> Result<Uuid> {
        let capacity = self.capacity_for(&request.resource_constraint_id)?;
        if request.permits == 0 {
            return Err(CoordinationError::Validation {
                field: "permits".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if request.permits > capacity {
            return Err(CoordinationError::PermitExceedsCapacity {
                resource_constraint_id: request.resource_constraint_id,
                resource_unit: request.resource_unit,
                permits: request.permits,
                capacity,
            });
        }

        let instance = self
            .ledger
            .insert_request(request, self.config.ledger.ttl())
            .await?;

        info!(
            event = events::PERMIT_REQUESTED,
            instance_id = %instance.id,
            resource_constraint_id = %instance.resource_constraint_id,
            resource_unit = %instance.resource_unit,
            permits = instance.permits,
            arrival_order = instance.order,
            release_entity_id = %instance.release_entity_id,
            actor = ctx.actor(),
            "Permit requested"
        );

        // Uncontended requests activate without waiting for a poll pass
        self.try_activate(&instance.resource_constraint_id, &instance.resource_unit)
            .await?;

        Ok(instance.id)
    }

    /// Re-evaluate one unit: force-finish expired rows, then activate
    /// BLOCKED rows in strict arrival order while capacity allows.
    ///
    /// Idempotent; safe to call from any number of processes. Conflicting
    /// writers cause a bounded re-read-and-re-evaluate, never a blocked
    /// thread.
    pub async fn try_activate(
        &self,
        resource_constraint_id: &str,
        resource_unit: &str,
    ) -> Result<ActivationSummary> {
        let capacity = self.capacity_for(resource_constraint_id)?;
        let attempts = self.config.ledger.cas_retry_attempts;

        let mut summary = ActivationSummary {
            capacity,
            ..ActivationSummary::default()
        };

        'pass: for _ in 0..attempts {
            let rows = self
                .ledger
                .list_unit(resource_constraint_id, resource_unit)
                .await?;
            let now = Utc::now();

            let mut finished_this_pass: HashSet<Uuid> = HashSet::new();
            for row in rows.iter().filter(|row| row.is_expired(now)) {
                match self
                    .ledger
                    .update_instance_state(row.id, row.version, PermitState::Finished, None)
                    .await?
                {
                    CasOutcome::Applied => {
                        warn!(
                            event = events::PERMIT_EXPIRED,
                            instance_id = %row.id,
                            resource_constraint_id = %row.resource_constraint_id,
                            resource_unit = %row.resource_unit,
                            state = %row.state,
                            release_entity_id = %row.release_entity_id,
                            valid_until = %row.valid_until,
                            "Permit request expired before release; force-finished"
                        );
                        summary.expired.push(row.id);
                        finished_this_pass.insert(row.id);
                    }
                    CasOutcome::Conflict => continue 'pass,
                }
            }

            let live: Vec<&ResourceConstraintInstance> = rows
                .iter()
                .filter(|row| !finished_this_pass.contains(&row.id))
                .collect();

            let mut active_permits: u32 = live
                .iter()
                .filter(|row| row.state == PermitState::Active)
                .map(|row| row.permits)
                .sum();

            for row in live.iter().filter(|row| row.state == PermitState::Blocked) {
                if active_permits + row.permits > capacity {
                    // Strict head-of-line blocking: nothing behind this row
                    // may be considered
                    break;
                }
                match self
                    .ledger
                    .update_instance_state(row.id, row.version, PermitState::Active, Some(now))
                    .await?
                {
                    CasOutcome::Applied => {
                        active_permits += row.permits;
                        summary.activated.push(row.id);
                        info!(
                            event = events::PERMIT_ACTIVATED,
                            instance_id = %row.id,
                            resource_constraint_id = %row.resource_constraint_id,
                            resource_unit = %row.resource_unit,
                            permits = row.permits,
                            active_permits = active_permits,
                            capacity = capacity,
                            "Permit activated"
                        );
                    }
                    CasOutcome::Conflict => continue 'pass,
                }
            }

            summary.active_permits = active_permits;
            return Ok(summary);
        }

        Err(CoordinationError::Conflict {
            document: "resource_constraint_instances".to_string(),
            attempts,
        })
    }

    /// Whether the request currently holds its permits
    pub async fn is_active(&self, instance_id: Uuid) -> Result<bool> {
        let instance = self
            .ledger
            .find_instance(instance_id)
            .await?
            .ok_or(CoordinationError::PermitNotFound { instance_id })?;
        Ok(instance.state == PermitState::Active)
    }

    /// Release a permit request and re-evaluate its unit.
    ///
    /// Idempotent: releasing an already-finished request is a no-op.
    pub async fn release(&self, ctx: &ExecutionContext, instance_id: Uuid) -> Result<()> {
        let attempts = self.config.ledger.cas_retry_attempts;
        let mut instance = self
            .ledger
            .find_instance(instance_id)
            .await?
            .ok_or(CoordinationError::PermitNotFound { instance_id })?;

        let mut released = instance.state == PermitState::Finished;
        for _ in 0..attempts {
            if released {
                break;
            }
            match self
                .ledger
                .update_instance_state(
                    instance.id,
                    instance.version,
                    PermitState::Finished,
                    None,
                )
                .await?
            {
                CasOutcome::Applied => {
                    info!(
                        event = events::PERMIT_RELEASED,
                        instance_id = %instance.id,
                        resource_constraint_id = %instance.resource_constraint_id,
                        resource_unit = %instance.resource_unit,
                        permits = instance.permits,
                        actor = ctx.actor(),
                        "Permit released"
                    );
                    released = true;
                }
                CasOutcome::Conflict => {
                    instance = self
                        .ledger
                        .find_instance(instance_id)
                        .await?
                        .ok_or(CoordinationError::PermitNotFound { instance_id })?;
                    released = instance.state == PermitState::Finished;
                }
            }
        }

        if !released {
            return Err(CoordinationError::Conflict {
                document: "resource_constraint_instances".to_string(),
                attempts,
            });
        }

        self.try_activate(&instance.resource_constraint_id, &instance.resource_unit)
            .await?;
        Ok(())
    }

    /// Non-finished requests held or awaited by one execution, for operator
    /// diagnostics
    pub async fn waiting_on(
        &self,
        release_entity_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>> {
        self.ledger.instances_for_entity(release_entity_id).await
    }

    /// Poller entry point: re-evaluate the unit owning one due row
    pub async fn revisit_instance(&self, instance_id: Uuid) -> Result<()> {
        let Some(instance) = self.ledger.find_instance(instance_id).await? else {
            debug!(instance_id = %instance_id, "Due permit row vanished; nothing to do");
            return Ok(());
        };
        if instance.state == PermitState::Finished {
            return Ok(());
        }
        self.try_activate(&instance.resource_constraint_id, &instance.resource_unit)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IterationHandler for ResourceScheduler {
    fn ledger_name(&self) -> &'static str {
        "resource_constraint_instances"
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        self.ledger.due_instances(now, limit).await
    }

    async fn revisit(&self, id: Uuid) -> Result<()> {
        self.revisit_instance(id).await
    }

    async fn reschedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.ledger.reschedule_instance(id, at).await
    }

    async fn purge(&self, now: DateTime<Utc>) -> Result<u64> {
        self.ledger.purge_finished(now).await
    }
}
