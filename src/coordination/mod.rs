//! # Execution Coordination
//!
//! The business logic riding on the ledger stores: the resource-constraint
//! scheduler (a distributed semaphore with strict arrival ordering), the
//! barrier coordinator (parallel-branch rendezvous), the generic ledger
//! poller that drives both, and the advisor hook the step executor calls.
//!
//! Everything here is crash-recoverable by construction: no coordinator
//! holds authoritative state in memory, every wait is a cooperative
//! re-poll, and every ledger mutation is a per-document optimistic write.

pub mod advisor;
pub mod barrier_coordinator;
pub mod poller;
pub mod resource_scheduler;

pub use advisor::{ExecutionAdvice, ExecutionAdvisor, ResourceAdvice};
pub use barrier_coordinator::BarrierCoordinator;
pub use poller::{IterationHandler, LedgerPoller, PollPassSummary};
pub use resource_scheduler::{ActivationSummary, ResourceScheduler};

/// Who is asking. Threaded explicitly through every mutating coordinator
/// call; there is no ambient thread-local identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// The workflow or pipeline execution on whose behalf the call is made
    pub execution_id: String,
    /// Acting principal, when the call is operator-initiated
    pub principal: Option<String>,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            principal: None,
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Name used in log attribution when no principal is present
    pub fn actor(&self) -> &str {
        self.principal.as_deref().unwrap_or("system")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_falls_back_to_system() {
        let ctx = ExecutionContext::new("exec-1");
        assert_eq!(ctx.actor(), "system");

        let ctx = ctx.with_principal("ops@example.com");
        assert_eq!(ctx.actor(), "ops@example.com");
    }
}
