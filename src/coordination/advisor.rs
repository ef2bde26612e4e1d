//! # Execution Advisor
//!
//! The interception point where the generic state-machine executor asks the
//! coordination core for a decision before advancing a running workflow.
//! The advisor holds no durable state of its own: every answer is computed
//! from the ledgers and the supplied policy documents, so an advisor on any
//! process (including one started after a crash) gives the same answer.
//!
//! Waits are cooperative: "not ready" comes back as [`ExecutionAdvice::Hold`]
//! with a re-poll hint, never as a blocked thread.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::coordination::{BarrierCoordinator, ExecutionContext, ResourceScheduler};
use crate::error::{CoordinationError, Result};
use crate::models::{ConcurrencyStrategy, FailureStrategy, NewPermitRequest, RepairActionCode};
use crate::policy::{decide, Disposition, FailureEvent};

/// What the executor should do next, in its own control vocabulary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionAdvice {
    /// Advance past the step
    Proceed,
    /// Not ready; re-invoke the advisor after the given interval
    Hold { retry_after: std::time::Duration },
    /// Re-run the failing step after the delay
    RetryStep { delay: Duration },
    /// Suspend and wait for an operator; `on_timeout` applies when the
    /// window expires
    PauseForIntervention {
        timeout: Option<Duration>,
        on_timeout: RepairActionCode,
    },
    /// Mark the step failed, keep the execution running
    MarkStepFailed,
    /// Fail the whole execution
    FailExecution,
}

/// Advice for a resource-gated step, carrying the permit id the executor
/// must persist and pass back on the next poll (and eventually release)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvice {
    pub instance_id: Uuid,
    pub advice: ExecutionAdvice,
}

/// Stateless facade over scheduler, barriers, and policy evaluation
pub struct ExecutionAdvisor {
    scheduler: Arc<ResourceScheduler>,
    barriers: Arc<BarrierCoordinator>,
    config: Arc<CoordinationConfig>,
}

impl ExecutionAdvisor {
    pub fn new(
        scheduler: Arc<ResourceScheduler>,
        barriers: Arc<BarrierCoordinator>,
        config: Arc<CoordinationConfig>,
    ) -> Self {
        Self {
            scheduler,
            barriers,
            config,
        }
    }

    /// Called before advancing past a barrier-bearing step. No state is
    /// mutated; a standing barrier means "hold and re-invoke later".
    pub async fn before_barrier(
        &self,
        ctx: &ExecutionContext,
        barrier_id: Uuid,
    ) -> Result<ExecutionAdvice> {
        if self.barriers.is_down(barrier_id).await? {
            Ok(ExecutionAdvice::Proceed)
        } else {
            debug!(
                barrier_id = %barrier_id,
                execution_id = %ctx.execution_id,
                "Barrier standing; advising hold"
            );
            Ok(self.hold())
        }
    }

    /// Called before advancing past a resource-gated step. On the first
    /// call (`existing` is `None`) the permit is requested; subsequent
    /// calls poll it. The executor persists the returned instance id with
    /// the step so the request survives restarts.
    pub async fn before_resource(
        &self,
        ctx: &ExecutionContext,
        request: NewPermitRequest,
        existing: Option<Uuid>,
    ) -> Result<ResourceAdvice> {
        let instance_id = match existing {
            Some(id) => id,
            None => self.scheduler.request_permit(ctx, request).await?,
        };

        let advice = if self.scheduler.is_active(instance_id).await? {
            ExecutionAdvice::Proceed
        } else {
            debug!(
                instance_id = %instance_id,
                execution_id = %ctx.execution_id,
                "Permit not yet active; advising hold"
            );
            self.hold()
        };

        Ok(ResourceAdvice {
            instance_id,
            advice,
        })
    }

    /// Called after a step completes or the execution aborts: give the
    /// permits back and wake up the next waiter.
    pub async fn after_resource(&self, ctx: &ExecutionContext, instance_id: Uuid) -> Result<()> {
        self.scheduler.release(ctx, instance_id).await
    }

    /// Translate a failure event into the executor's control vocabulary.
    /// Total: always produces advice, never errors.
    pub fn on_failure(
        &self,
        event: &FailureEvent,
        strategies: &[FailureStrategy],
    ) -> ExecutionAdvice {
        match decide(event, strategies) {
            Disposition::Continue => ExecutionAdvice::Proceed,
            Disposition::Retry { delay } => ExecutionAdvice::RetryStep { delay },
            Disposition::Pause {
                timeout,
                on_timeout,
            } => ExecutionAdvice::PauseForIntervention {
                timeout,
                on_timeout,
            },
            Disposition::Fail => ExecutionAdvice::FailExecution,
            Disposition::MarkFailed => ExecutionAdvice::MarkStepFailed,
        }
    }

    /// Validate the workflow's concurrency strategy before it issues any
    /// resource or barrier request: the strategy bounds how many permit
    /// requests one execution may hold at once.
    pub async fn validate_concurrency(
        &self,
        ctx: &ExecutionContext,
        strategy: &ConcurrencyStrategy,
    ) -> Result<()> {
        strategy.validate()?;

        if let Some(bound) = strategy.permitted_concurrent_requests() {
            let outstanding = self.scheduler.waiting_on(&ctx.execution_id).await?.len();
            if outstanding as u32 >= bound {
                return Err(CoordinationError::Validation {
                    field: "concurrency_strategy".to_string(),
                    reason: format!(
                        "execution {} already holds {outstanding} resource requests, bound is {bound}",
                        ctx.execution_id
                    ),
                });
            }
        }
        Ok(())
    }

    fn hold(&self) -> ExecutionAdvice {
        ExecutionAdvice::Hold {
            retry_after: self.config.poller.poll_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BarrierWorkflow, FailureType};
    use crate::store::memory::InMemoryLedgers;

    fn advisor_with_capacity(capacity: u32) -> ExecutionAdvisor {
        let ledgers = Arc::new(InMemoryLedgers::new());
        let mut config = CoordinationConfig::default();
        config
            .capacities
            .insert("deploy-slots".to_string(), capacity);
        let config = Arc::new(config);
        ExecutionAdvisor::new(
            Arc::new(ResourceScheduler::new(ledgers.clone(), config.clone())),
            Arc::new(BarrierCoordinator::new(ledgers, config.clone())),
            config,
        )
    }

    fn ctx(execution_id: &str) -> ExecutionContext {
        ExecutionContext::new(execution_id)
    }

    fn permit_request(entity: &str) -> NewPermitRequest {
        NewPermitRequest {
            resource_constraint_id: "deploy-slots".to_string(),
            resource_unit: "prod".to_string(),
            permits: 1,
            release_entity_type: "workflow_execution".to_string(),
            release_entity_id: entity.to_string(),
        }
    }

    fn participant(stage: &str, step: &str) -> BarrierWorkflow {
        BarrierWorkflow {
            pipeline_stage_id: stage.to_string(),
            workflow_execution_id: format!("wf-{stage}"),
            phase_uuid: "phase-1".to_string(),
            step_uuid: step.to_string(),
            phase_execution_id: None,
            step_execution_id: None,
        }
    }

    #[tokio::test]
    async fn standing_barrier_advises_hold_then_proceed() {
        let advisor = advisor_with_capacity(1);
        let barrier_id = advisor
            .barriers
            .create_barrier(
                &ctx("exec-1"),
                "pre-deploy",
                "exec-1",
                0,
                vec![participant("stage-a", "p1"), participant("stage-b", "p2")],
            )
            .await
            .unwrap();

        let advice = advisor.before_barrier(&ctx("exec-1"), barrier_id).await.unwrap();
        assert!(matches!(advice, ExecutionAdvice::Hold { .. }));

        advisor
            .barriers
            .signal_arrival(&ctx("exec-1"), barrier_id, "stage-a.p1")
            .await
            .unwrap();
        advisor
            .barriers
            .signal_arrival(&ctx("exec-1"), barrier_id, "stage-b.p2")
            .await
            .unwrap();

        let advice = advisor.before_barrier(&ctx("exec-1"), barrier_id).await.unwrap();
        assert_eq!(advice, ExecutionAdvice::Proceed);
    }

    #[tokio::test]
    async fn resource_advice_requests_once_then_polls() {
        let advisor = advisor_with_capacity(1);

        let first = advisor
            .before_resource(&ctx("exec-1"), permit_request("exec-1"), None)
            .await
            .unwrap();
        assert_eq!(first.advice, ExecutionAdvice::Proceed);

        // Second execution queues behind the first
        let queued = advisor
            .before_resource(&ctx("exec-2"), permit_request("exec-2"), None)
            .await
            .unwrap();
        assert!(matches!(queued.advice, ExecutionAdvice::Hold { .. }));

        // Re-polling with the persisted id does not create a second request
        let repoll = advisor
            .before_resource(&ctx("exec-2"), permit_request("exec-2"), Some(queued.instance_id))
            .await
            .unwrap();
        assert_eq!(repoll.instance_id, queued.instance_id);
        assert!(matches!(repoll.advice, ExecutionAdvice::Hold { .. }));

        // Releasing the first permit promotes the queued one
        advisor
            .after_resource(&ctx("exec-1"), first.instance_id)
            .await
            .unwrap();
        let promoted = advisor
            .before_resource(&ctx("exec-2"), permit_request("exec-2"), Some(queued.instance_id))
            .await
            .unwrap();
        assert_eq!(promoted.advice, ExecutionAdvice::Proceed);
    }

    #[tokio::test]
    async fn sequential_strategy_bounds_outstanding_requests() {
        let advisor = advisor_with_capacity(2);
        let strategy = ConcurrencyStrategy::sequential();

        advisor
            .validate_concurrency(&ctx("exec-1"), &strategy)
            .await
            .unwrap();
        advisor
            .before_resource(&ctx("exec-1"), permit_request("exec-1"), None)
            .await
            .unwrap();

        let err = advisor
            .validate_concurrency(&ctx("exec-1"), &strategy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Validation { .. }));

        // Unbounded parallel never trips the check
        advisor
            .validate_concurrency(&ctx("exec-1"), &ConcurrencyStrategy::parallel(None))
            .await
            .unwrap();
    }

    #[test]
    fn failure_dispositions_map_to_executor_vocabulary() {
        let advisor = advisor_with_capacity(1);
        let event = FailureEvent::new(FailureType::ApplicationError, "deploy");

        // No strategies: total default is fail-the-execution
        assert_eq!(advisor.on_failure(&event, &[]), ExecutionAdvice::FailExecution);

        let retrying = FailureStrategy {
            failure_types: vec![FailureType::ApplicationError],
            specific_steps: vec![],
            repair_action_code: RepairActionCode::Retry,
            retry_count: 1,
            retry_intervals: vec![Duration::seconds(5)],
            repair_action_code_after_retry: RepairActionCode::MarkStepFailed,
            failure_criteria: None,
            manual_intervention_timeout: None,
            action_after_timeout: None,
        };
        assert_eq!(
            advisor.on_failure(&event, std::slice::from_ref(&retrying)),
            ExecutionAdvice::RetryStep {
                delay: Duration::seconds(5)
            }
        );
        assert_eq!(
            advisor.on_failure(&event.clone().with_attempt(1), &[retrying]),
            ExecutionAdvice::MarkStepFailed
        );
    }
}
