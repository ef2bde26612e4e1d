#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Coordination
//!
//! Execution coordination core for a continuous-delivery orchestration
//! platform: the pieces that let concurrent, long-running workflow
//! executions rendezvous at barriers and compete fairly for scarce, named
//! resources, while surviving process restarts.
//!
//! ## Architecture
//!
//! All durable state lives in shared ledgers (barrier instances and
//! resource-constraint instances) behind the [`store`] traits; the
//! coordinators in [`coordination`] are logic over ledger snapshots. Every
//! wait is a cooperative re-poll driven by the [`coordination::LedgerPoller`]
//! (possibly on a different process than the one that issued the request),
//! and every mutation is a per-document optimistic write: no cross-document
//! locks, no thread parked on a condition.
//!
//! ## Module Organization
//!
//! - [`models`] - Ledger row types and read-only policy documents
//! - [`store`] - Ledger persistence traits with in-memory and Postgres implementations
//! - [`coordination`] - Resource scheduler, barrier coordinator, poller, and the advisor hook
//! - [`policy`] - Pure failure-strategy evaluation
//! - [`config`] - Layered configuration (defaults, TOML file, environment)
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured tracing initialization
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use pipeline_coordination::config::CoordinationConfig;
//! use pipeline_coordination::coordination::{ExecutionContext, ResourceScheduler};
//! use pipeline_coordination::models::NewPermitRequest;
//! use pipeline_coordination::store::memory::InMemoryLedgers;
//!
//! # async fn example() -> pipeline_coordination::Result<()> {
//! let mut config = CoordinationConfig::default();
//! config.capacities.insert("deploy-slots".to_string(), 2);
//!
//! let ledgers = Arc::new(InMemoryLedgers::new());
//! let scheduler = ResourceScheduler::new(ledgers, Arc::new(config));
//!
//! let ctx = ExecutionContext::new("exec-42");
//! let request = NewPermitRequest {
//!     resource_constraint_id: "deploy-slots".to_string(),
//!     resource_unit: "prod-cluster".to_string(),
//!     permits: 1,
//!     release_entity_type: "workflow_execution".to_string(),
//!     release_entity_id: "exec-42".to_string(),
//! };
//! let instance_id = scheduler.request_permit(&ctx, request).await?;
//!
//! // The caller does not block: poll until the permit activates, then
//! // release it when the gated step completes.
//! if scheduler.is_active(instance_id).await? {
//!     scheduler.release(&ctx, instance_id).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod coordination;
pub mod error;
pub mod logging;
pub mod models;
pub mod policy;
pub mod store;

pub use config::CoordinationConfig;
pub use coordination::{
    BarrierCoordinator, ExecutionAdvice, ExecutionAdvisor, ExecutionContext, IterationHandler,
    LedgerPoller, ResourceAdvice, ResourceScheduler,
};
pub use error::{CoordinationError, Result};
pub use models::{
    BarrierInstance, BarrierState, BarrierWorkflow, ConcurrencyStrategy, FailureStrategy,
    FailureType, NewPermitRequest, PermitState, RepairActionCode, ResourceConstraintInstance,
};
pub use policy::{decide, Disposition, FailureEvent};
