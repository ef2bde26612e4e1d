//! # Coordination Data Model
//!
//! Ledger row types and the read-only policy documents the coordinators
//! consume. All ledger rows are owned by the shared store; in-process copies
//! are snapshots carrying an optimistic-concurrency `version` and must be
//! re-fetched before mutation.

pub mod barrier_instance;
pub mod concurrency_strategy;
pub mod failure_strategy;
pub mod resource_constraint_instance;

pub use barrier_instance::{
    BarrierDownReason, BarrierInstance, BarrierPipeline, BarrierState, BarrierWorkflow,
};
pub use concurrency_strategy::{ConcurrencyKind, ConcurrencyStrategy};
pub use failure_strategy::{FailureCriteria, FailureStrategy, FailureType, RepairActionCode};
pub use resource_constraint_instance::{
    NewPermitRequest, PermitState, ResourceConstraintInstance,
};
