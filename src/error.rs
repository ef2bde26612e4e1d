//! # Coordination Error Types
//!
//! Structured error handling for the coordination core using thiserror
//! instead of `Box<dyn Error>` patterns.
//!
//! Expected poll outcomes (barrier still standing, permit still blocked) are
//! ordinary return values on the coordinator APIs, never errors. Everything
//! here is either a caller mistake (configuration errors, duplicates), a
//! storage failure, or optimistic-concurrency exhaustion.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the coordination core
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Permit request for {permits} permits exceeds capacity {capacity} on resource constraint {resource_constraint_id}/{resource_unit}")]
    PermitExceedsCapacity {
        resource_constraint_id: String,
        resource_unit: String,
        permits: u32,
        capacity: u32,
    },

    #[error("No capacity configured for resource constraint: {resource_constraint_id}")]
    UnknownResourceConstraint { resource_constraint_id: String },

    #[error("Permit instance not found: {instance_id}")]
    PermitNotFound { instance_id: Uuid },

    #[error("Barrier already exists: {name} (execution {execution_id}, parallel index {parallel_index})")]
    DuplicateBarrier {
        name: String,
        execution_id: String,
        parallel_index: i32,
    },

    #[error("Barrier not found: {barrier_id}")]
    BarrierNotFound { barrier_id: Uuid },

    #[error("Participant key {participant_key} is not expected at barrier {barrier_id}")]
    UnknownParticipant {
        barrier_id: Uuid,
        participant_key: String,
    },

    #[error("Optimistic concurrency conflict on {document} not resolved after {attempts} attempts")]
    Conflict { document: String, attempts: u32 },

    #[error("Validation error: {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Storage error during {operation}")]
    Storage {
        operation: String,
        #[source]
        source: sqlx::Error,
    },
}

impl CoordinationError {
    /// Wrap a database error with the operation it interrupted
    pub fn storage(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Storage {
            operation: operation.into(),
            source,
        }
    }

    /// True for caller mistakes that must never be retried automatically
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::PermitExceedsCapacity { .. }
                | Self::UnknownResourceConstraint { .. }
                | Self::DuplicateBarrier { .. }
                | Self::Validation { .. }
                | Self::Configuration { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_flagged() {
        let err = CoordinationError::PermitExceedsCapacity {
            resource_constraint_id: "deploy-slots".to_string(),
            resource_unit: "prod".to_string(),
            permits: 5,
            capacity: 2,
        };
        assert!(err.is_configuration_error());

        let err = CoordinationError::Conflict {
            document: "barrier_instances".to_string(),
            attempts: 5,
        };
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn display_includes_identifiers() {
        let err = CoordinationError::DuplicateBarrier {
            name: "pre-deploy".to_string(),
            execution_id: "exec-1".to_string(),
            parallel_index: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("pre-deploy"));
        assert!(msg.contains("exec-1"));
    }
}
