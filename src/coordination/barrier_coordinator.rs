//! # Barrier Coordinator
//!
//! Rendezvous for the parallel branches of one pipeline execution. Branches
//! signal arrival as they reach the barrier point and poll
//! [`BarrierCoordinator::is_down`] until released; the coordinator flips the
//! barrier STANDING -> DOWN exactly once, when the arrived-key set covers
//! the fixed participant set.
//!
//! The flip is a version-checked write: two signalers that both observe
//! "last participant arrived" race on the same document version, exactly
//! one applies the flip, and the loser re-reads, sees DOWN, and treats it
//! as success.
//!
//! A branch that dies before signaling leaves the barrier STANDING. That is
//! deliberate: the coordinator never guesses at liveness. The stuck barrier
//! surfaces through TTL expiry (poller pass) or an explicit
//! [`BarrierCoordinator::force_clear`] from the abort path.

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
use crate::models::{
    BarrierDownReason, BarrierInstance, BarrierPipeline, BarrierState, BarrierWorkflow,
};
use crate::store::{BarrierLedger, CasOutcome};

/// Rendezvous coordinator over the barrier ledger
pub struct BarrierCoordinator {
    ledger: Arc<dyn BarrierLedger>,
    config: Arc<CoordinationConfig>,
}

impl BarrierCoordinator {
    pub fn new(ledger: Arc<dyn BarrierLedger>, config: Arc<CoordinationConfig>) -> Self {
        Self { ledger, config }
    }

    /// Persist a STANDING barrier with its fixed participant set.
    ///
    /// Fails with `DuplicateBarrier` when `(name, execution_id,
    /// parallel_index)` already exists.
    pub async fn create_barrier(
        &self,
        ctx: &ExecutionContext,
        name: impl Into<String>,
        execution_id: impl Into<String>,
        parallel_index: i32,
        participants: Vec<BarrierWorkflow>,
    ) -> Result<Uuid> {
        if participants.is_empty() {
            return Err(CoordinationError::Validation {
                field: "participants".to_string(),
                reason: "a barrier needs at least one expected participant".to_string(),
            });
        }

        let pipeline = BarrierPipeline {
            execution_id: execution_id.into(),
            parallel_index,
            workflows: participants,
        };
        let barrier =
            BarrierInstance::new_standing(name, pipeline, self.config.ledger.ttl());
        let barrier_id = barrier.id;
        let expected = barrier.expected_keys().len();

        self.ledger.insert_barrier(barrier.clone()).await?;

        info!(
            event = events::BARRIER_CREATED,
            barrier_id = %barrier_id,
            name = %barrier.name,
            execution_id = %barrier.pipeline.execution_id,
            parallel_index = barrier.pipeline.parallel_index,
            expected_participants = expected,
            actor = ctx.actor(),
            "Barrier created"
        );
        Ok(barrier_id)
    }

    /// Record one participant's arrival. Idempotent: re-signaling an
    /// already-arrived participant (or a barrier already down) is a no-op
    /// success. Returns the barrier state after the signal.
    pub async fn signal_arrival(
        &self,
        ctx: &ExecutionContext,
        barrier_id: Uuid,
        participant_key: &str,
    ) -> Result<BarrierState> {
        let attempts = self.config.ledger.cas_retry_attempts;

        for _ in 0..attempts {
            let barrier = self.require_barrier(barrier_id).await?;

            if barrier.state == BarrierState::Down {
                return Ok(BarrierState::Down);
            }
            if !barrier.expects(participant_key) {
                return Err(CoordinationError::UnknownParticipant {
                    barrier_id,
                    participant_key: participant_key.to_string(),
                });
            }

            if !barrier.arrived_keys.iter().any(|k| k == participant_key) {
                let mut arrived = barrier.arrived_keys.clone();
                arrived.push(participant_key.to_string());
                match self
                    .ledger
                    .update_arrivals(barrier_id, barrier.version, arrived)
                    .await?
                {
                    CasOutcome::Applied => {
                        info!(
                            event = events::BARRIER_ARRIVAL,
                            barrier_id = %barrier_id,
                            name = %barrier.name,
                            participant_key = participant_key,
                            outstanding = barrier.outstanding_keys().len() - 1,
                            actor = ctx.actor(),
                            "Participant arrived at barrier"
                        );
                    }
                    // Another signaler got in first; re-read and re-apply
                    CasOutcome::Conflict => continue,
                }
            }

            // Re-read so the completeness check and the flip both run
            // against the freshest version
            let barrier = self.require_barrier(barrier_id).await?;
            if barrier.state == BarrierState::Down {
                return Ok(BarrierState::Down);
            }
            if !barrier.all_arrived() {
                return Ok(BarrierState::Standing);
            }

            match self
                .ledger
                .update_barrier_state(
                    barrier_id,
                    barrier.version,
                    BarrierState::Down,
                    Some(BarrierDownReason::AllArrived),
                )
                .await?
            {
                CasOutcome::Applied => {
                    info!(
                        event = events::BARRIER_DOWN,
                        barrier_id = %barrier_id,
                        name = %barrier.name,
                        execution_id = %barrier.pipeline.execution_id,
                        participants = barrier.expected_keys().len(),
                        "All participants arrived; barrier released"
                    );
                    return Ok(BarrierState::Down);
                }
                // The racing signaler flipped it (or added an arrival);
                // loop to observe the applied result
                CasOutcome::Conflict => continue,
            }
        }

        Err(CoordinationError::Conflict {
            document: "barrier_instances".to_string(),
            attempts,
        })
    }

    /// Poll-style check used by waiting branches. A `false` means
    /// "re-poll later", never "spin".
    pub async fn is_down(&self, barrier_id: Uuid) -> Result<bool> {
        let barrier = self.require_barrier(barrier_id).await?;
        Ok(barrier.state == BarrierState::Down)
    }

    /// Force a barrier down, releasing all waiters. The abort path for an
    /// explicitly cancelled pipeline execution; idempotent.
    pub async fn force_clear(&self, ctx: &ExecutionContext, barrier_id: Uuid) -> Result<()> {
        let attempts = self.config.ledger.cas_retry_attempts;

        for _ in 0..attempts {
            let barrier = self.require_barrier(barrier_id).await?;
            if barrier.state == BarrierState::Down {
                return Ok(());
            }
            match self
                .ledger
                .update_barrier_state(
                    barrier_id,
                    barrier.version,
                    BarrierState::Down,
                    Some(BarrierDownReason::ForceCleared),
                )
                .await?
            {
                CasOutcome::Applied => {
                    warn!(
                        event = events::BARRIER_FORCE_CLEARED,
                        barrier_id = %barrier_id,
                        name = %barrier.name,
                        execution_id = %barrier.pipeline.execution_id,
                        outstanding = barrier.outstanding_keys().len(),
                        actor = ctx.actor(),
                        "Barrier force-cleared before all participants arrived"
                    );
                    return Ok(());
                }
                CasOutcome::Conflict => continue,
            }
        }

        Err(CoordinationError::Conflict {
            document: "barrier_instances".to_string(),
            attempts,
        })
    }

    /// Standing barriers of one pipeline execution, for operator
    /// diagnostics ("what is this execution waiting on")
    pub async fn standing_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<BarrierInstance>> {
        self.ledger.standing_for_execution(execution_id).await
    }

    /// Poller entry point: release a standing barrier whose arrival set
    /// is already complete, or expire it once its TTL elapsed.
    ///
    /// The release half covers the crash window inside `signal_arrival`
    /// where the last arrival was durably recorded but the signaler died
    /// before flipping the state. The expiry half is the stuck-barrier
    /// alert path: a branch died before signaling, nothing will ever
    /// complete the arrival set, and the hard TTL is the backstop.
    pub async fn revisit_barrier(&self, barrier_id: Uuid) -> Result<()> {
        let Some(barrier) = self.ledger.find_barrier(barrier_id).await? else {
            debug!(barrier_id = %barrier_id, "Due barrier vanished; nothing to do");
            return Ok(());
        };
        if barrier.state == BarrierState::Down {
            return Ok(());
        }

        if barrier.all_arrived() {
            match self
                .ledger
                .update_barrier_state(
                    barrier_id,
                    barrier.version,
                    BarrierState::Down,
                    Some(BarrierDownReason::AllArrived),
                )
                .await?
            {
                CasOutcome::Applied => {
                    info!(
                        event = events::BARRIER_DOWN,
                        barrier_id = %barrier_id,
                        name = %barrier.name,
                        execution_id = %barrier.pipeline.execution_id,
                        participants = barrier.expected_keys().len(),
                        "Complete arrival set found on revisit; barrier released"
                    );
                }
                // Concurrent signal or clear resolved it
                CasOutcome::Conflict => {}
            }
            return Ok(());
        }

        if !barrier.is_expired(Utc::now()) {
            return Ok(());
        }

        match self
            .ledger
            .update_barrier_state(
                barrier_id,
                barrier.version,
                BarrierState::Down,
                Some(BarrierDownReason::Expired),
            )
            .await?
        {
            CasOutcome::Applied => {
                warn!(
                    event = events::BARRIER_EXPIRED,
                    barrier_id = %barrier_id,
                    name = %barrier.name,
                    execution_id = %barrier.pipeline.execution_id,
                    outstanding = barrier.outstanding_keys().len(),
                    valid_until = %barrier.valid_until,
                    "Stuck barrier expired by TTL; waiters released, operator attention required"
                );
            }
            // Concurrent signal or clear resolved it; the applied result stands
            CasOutcome::Conflict => {}
        }
        Ok(())
    }

    async fn require_barrier(&self, barrier_id: Uuid) -> Result<BarrierInstance> {
        self.ledger
            .find_barrier(barrier_id)
            .await?
            .ok_or(CoordinationError::BarrierNotFound { barrier_id })
    }
}

#[async_trait]
impl IterationHandler for BarrierCoordinator {
    fn ledger_name(&self) -> &'static str {
        "barrier_instances"
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        self.ledger.due_barriers(now, limit).await
    }

    async fn revisit(&self, id: Uuid) -> Result<()> {
        self.revisit_barrier(id).await
    }

    async fn reschedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.ledger.reschedule_barrier(id, at).await
    }

    async fn purge(&self, now: DateTime<Utc>) -> Result<u64> {
        self.ledger.purge_downed(now).await
    }
}
