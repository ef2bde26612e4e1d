//! End-to-end coordination scenarios over the in-memory ledgers: an
//! executor-shaped consumer driving the advisor, the poller, and both
//! coordinators together.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use pipeline_coordination::config::CoordinationConfig;
use pipeline_coordination::coordination::{
    BarrierCoordinator, ExecutionAdvice, ExecutionAdvisor, ExecutionContext, LedgerPoller,
    ResourceScheduler,
};
use pipeline_coordination::models::{
    BarrierDownReason, BarrierState, BarrierWorkflow, FailureStrategy, FailureType,
    NewPermitRequest, RepairActionCode,
};
use pipeline_coordination::policy::FailureEvent;
use pipeline_coordination::store::memory::InMemoryLedgers;
use pipeline_coordination::store::BarrierLedger;

struct Harness {
    ledgers: Arc<InMemoryLedgers>,
    scheduler: Arc<ResourceScheduler>,
    barriers: Arc<BarrierCoordinator>,
    advisor: ExecutionAdvisor,
}

fn harness(capacity: u32) -> Harness {
    let mut config = CoordinationConfig::default();
    config.capacities.insert("deploy-slots".to_string(), capacity);
    let config = Arc::new(config);

    let ledgers = Arc::new(InMemoryLedgers::new());
    let scheduler = Arc::new(ResourceScheduler::new(ledgers.clone(), config.clone()));
    let barriers = Arc::new(BarrierCoordinator::new(ledgers.clone(), config.clone()));
    let advisor = ExecutionAdvisor::new(scheduler.clone(), barriers.clone(), config.clone());

    Harness {
        ledgers,
        scheduler,
        barriers,
        advisor,
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

fn permit_request(entity: &str, permits: u32) -> NewPermitRequest {
    NewPermitRequest {
        resource_constraint_id: "deploy-slots".to_string(),
        resource_unit: "prod".to_string(),
        permits,
        release_entity_type: "workflow_execution".to_string(),
        release_entity_id: entity.to_string(),
    }
}

#[tokio::test]
async fn capacity_two_admits_exactly_the_arrival_prefix() -> Result<()> {
    let h = harness(2);
    let ctx = ExecutionContext::new("exec-1");

    // A, B, C arrive in order with one permit each
    let a = h.scheduler.request_permit(&ctx, permit_request("exec-a", 1)).await?;
    let b = h.scheduler.request_permit(&ctx, permit_request("exec-b", 1)).await?;
    let c = h.scheduler.request_permit(&ctx, permit_request("exec-c", 1)).await?;

    assert!(h.scheduler.is_active(a).await?);
    assert!(h.scheduler.is_active(b).await?);
    assert!(!h.scheduler.is_active(c).await?);

    // C stays blocked until a slot frees, then activates
    h.scheduler.release(&ctx, b).await?;
    assert!(h.scheduler.is_active(c).await?);
    Ok(())
}

#[tokio::test]
async fn executor_flow_over_a_resource_gated_step() -> Result<()> {
    let h = harness(1);
    let holder = ExecutionContext::new("exec-holder");
    let waiter = ExecutionContext::new("exec-waiter");

    let held = h
        .advisor
        .before_resource(&holder, permit_request("exec-holder", 1), None)
        .await?;
    assert_eq!(held.advice, ExecutionAdvice::Proceed);

    // The waiting executor persists the instance id and re-polls
    let queued = h
        .advisor
        .before_resource(&waiter, permit_request("exec-waiter", 1), None)
        .await?;
    assert!(matches!(queued.advice, ExecutionAdvice::Hold { .. }));

    // Operators can see what the waiter is queued on
    let waiting = h.scheduler.waiting_on("exec-waiter").await?;
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, queued.instance_id);

    // Holder finishes its gated step; the waiter's next poll proceeds
    h.advisor.after_resource(&holder, held.instance_id).await?;
    let repoll = h
        .advisor
        .before_resource(&waiter, permit_request("exec-waiter", 1), Some(queued.instance_id))
        .await?;
    assert_eq!(repoll.advice, ExecutionAdvice::Proceed);
    Ok(())
}

#[tokio::test]
async fn parallel_branches_rendezvous_at_a_barrier() -> Result<()> {
    let h = harness(1);
    let ctx = ExecutionContext::new("exec-1");

    let barrier_id = h
        .barriers
        .create_barrier(
            &ctx,
            "pre-deploy",
            "exec-1",
            0,
            vec![
                participant("stage-a", "p1"),
                participant("stage-b", "p2"),
                participant("stage-c", "p3"),
            ],
        )
        .await?;

    // Two branches arrive and are told to hold
    h.barriers.signal_arrival(&ctx, barrier_id, "stage-a.p1").await?;
    h.barriers.signal_arrival(&ctx, barrier_id, "stage-c.p3").await?;
    let advice = h.advisor.before_barrier(&ctx, barrier_id).await?;
    assert!(matches!(advice, ExecutionAdvice::Hold { .. }));

    // The last branch releases everyone
    let state = h.barriers.signal_arrival(&ctx, barrier_id, "stage-b.p2").await?;
    assert_eq!(state, BarrierState::Down);
    let advice = h.advisor.before_barrier(&ctx, barrier_id).await?;
    assert_eq!(advice, ExecutionAdvice::Proceed);

    let barrier = h.ledgers.find_barrier(barrier_id).await?.unwrap();
    assert_eq!(barrier.down_reason, Some(BarrierDownReason::AllArrived));
    Ok(())
}

#[tokio::test]
async fn poller_passes_expire_then_purge_stuck_state() -> Result<()> {
    let mut config = CoordinationConfig::default();
    config.capacities.insert("deploy-slots".to_string(), 2);
    config.ledger.ttl_secs = 0; // everything is immediately stuck
    let config = Arc::new(config);

    let ledgers = Arc::new(InMemoryLedgers::new());
    let scheduler = Arc::new(ResourceScheduler::new(ledgers.clone(), config.clone()));
    let barriers = Arc::new(BarrierCoordinator::new(ledgers.clone(), config.clone()));
    let ctx = ExecutionContext::new("exec-1");

    let barrier_id = barriers
        .create_barrier(
            &ctx,
            "pre-deploy",
            "exec-1",
            0,
            vec![participant("stage-a", "p1"), participant("stage-b", "p2")],
        )
        .await?;

    let poller = LedgerPoller::new(config.poller.clone())
        .register(scheduler.clone())
        .register(barriers.clone());

    let first = poller.tick(Utc::now()).await;
    assert_eq!(first.failed, 0);
    assert!(first.visited >= 1);

    // The stuck barrier was expired, releasing (hypothetical) waiters
    let barrier = ledgers.find_barrier(barrier_id).await?.unwrap();
    assert_eq!(barrier.state, BarrierState::Down);
    assert_eq!(barrier.down_reason, Some(BarrierDownReason::Expired));

    // A second pass right away finds nothing due (rescheduling pushed
    // everything past the backoff window) and deletes the downed barrier
    // now that its validity window has lapsed
    let second = poller.tick(Utc::now()).await;
    assert_eq!(second.visited, 0);
    assert_eq!(second.purged, 1);
    assert!(ledgers.find_barrier(barrier_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn aborted_pipeline_force_clears_its_barriers() -> Result<()> {
    let h = harness(1);
    let ctx = ExecutionContext::new("exec-1");
    let abort_ctx = ExecutionContext::new("exec-1").with_principal("ops@example.com");

    let barrier_id = h
        .barriers
        .create_barrier(
            &ctx,
            "pre-deploy",
            "exec-1",
            0,
            vec![participant("stage-a", "p1"), participant("stage-b", "p2")],
        )
        .await?;
    h.barriers.signal_arrival(&ctx, barrier_id, "stage-a.p1").await?;

    // Abort path: every standing barrier of the execution is force-cleared
    for barrier in h.barriers.standing_for_execution("exec-1").await? {
        h.barriers.force_clear(&abort_ctx, barrier.id).await?;
    }

    assert!(h.barriers.is_down(barrier_id).await?);
    assert!(h.barriers.standing_for_execution("exec-1").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failure_advice_follows_the_configured_strategy() -> Result<()> {
    let h = harness(1);

    let strategies = vec![FailureStrategy {
        failure_types: vec![FailureType::TimeoutError],
        specific_steps: vec![],
        repair_action_code: RepairActionCode::Retry,
        retry_count: 2,
        retry_intervals: vec![chrono::Duration::seconds(5)],
        repair_action_code_after_retry: RepairActionCode::ManualIntervention,
        failure_criteria: None,
        manual_intervention_timeout: Some(chrono::Duration::minutes(15)),
        action_after_timeout: Some(RepairActionCode::EndExecution),
    }];
    for strategy in &strategies {
        strategy.validate()?;
    }

    let event = FailureEvent::new(FailureType::TimeoutError, "deploy");
    assert_eq!(
        h.advisor.on_failure(&event, &strategies),
        ExecutionAdvice::RetryStep {
            delay: chrono::Duration::seconds(5)
        }
    );
    assert_eq!(
        h.advisor.on_failure(&event.clone().with_attempt(2), &strategies),
        ExecutionAdvice::PauseForIntervention {
            timeout: Some(chrono::Duration::minutes(15)),
            on_timeout: RepairActionCode::EndExecution,
        }
    );

    // A failure type no strategy covers fails the execution
    let unmatched = FailureEvent::new(FailureType::AuthenticationError, "deploy");
    assert_eq!(
        h.advisor.on_failure(&unmatched, &strategies),
        ExecutionAdvice::FailExecution
    );
    Ok(())
}
