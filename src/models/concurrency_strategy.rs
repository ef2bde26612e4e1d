//! # Concurrency Strategy
//!
//! Per-workflow policy governing whether phases run in parallel or
//! sequentially. The step executor owns phase scheduling; the coordinator
//! validates the strategy up front because it bounds how many concurrent
//! resource requests a single workflow execution may generate.

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyKind {
    /// Phases run one at a time; at most one outstanding resource request
    Sequential,
    /// Phases run concurrently, optionally bounded
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyStrategy {
    pub kind: ConcurrencyKind,
    /// Upper bound on concurrent phases when parallel; `None` means
    /// unbounded
    #[serde(default)]
    pub max_concurrent_phases: Option<u32>,
}

impl ConcurrencyStrategy {
    pub fn sequential() -> Self {
        Self {
            kind: ConcurrencyKind::Sequential,
            max_concurrent_phases: None,
        }
    }

    pub fn parallel(max_concurrent_phases: Option<u32>) -> Self {
        Self {
            kind: ConcurrencyKind::Parallel,
            max_concurrent_phases,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.kind {
            ConcurrencyKind::Sequential => {
                if self.max_concurrent_phases.is_some() {
                    return Err(CoordinationError::Validation {
                        field: "max_concurrent_phases".to_string(),
                        reason: "not applicable to sequential execution".to_string(),
                    });
                }
            }
            ConcurrencyKind::Parallel => {
                if self.max_concurrent_phases == Some(0) {
                    return Err(CoordinationError::Validation {
                        field: "max_concurrent_phases".to_string(),
                        reason: "must be at least 1 when set".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// How many resource requests this execution may hold at once.
    ///
    /// `None` means unbounded (unlimited parallel phases).
    pub fn permitted_concurrent_requests(&self) -> Option<u32> {
        match self.kind {
            ConcurrencyKind::Sequential => Some(1),
            ConcurrencyKind::Parallel => self.max_concurrent_phases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_permits_single_request() {
        let strategy = ConcurrencyStrategy::sequential();
        assert!(strategy.validate().is_ok());
        assert_eq!(strategy.permitted_concurrent_requests(), Some(1));
    }

    #[test]
    fn parallel_zero_bound_is_invalid() {
        assert!(ConcurrencyStrategy::parallel(Some(0)).validate().is_err());
        assert!(ConcurrencyStrategy::parallel(Some(4)).validate().is_ok());
        assert!(ConcurrencyStrategy::parallel(None).validate().is_ok());
    }

    #[test]
    fn sequential_rejects_bound() {
        let strategy = ConcurrencyStrategy {
            kind: ConcurrencyKind::Sequential,
            max_concurrent_phases: Some(2),
        };
        assert!(strategy.validate().is_err());
    }

    #[test]
    fn unbounded_parallel_is_unlimited() {
        assert_eq!(
            ConcurrencyStrategy::parallel(None).permitted_concurrent_requests(),
            None
        );
        assert_eq!(
            ConcurrencyStrategy::parallel(Some(3)).permitted_concurrent_requests(),
            Some(3)
        );
    }
}
