//! # Configuration Management
//!
//! Layered configuration for the coordination core: serde defaults, an
//! optional TOML file, then `PIPELINE_COORD_`-prefixed environment
//! overrides (double underscore as the section separator, e.g.
//! `PIPELINE_COORD_POLLER__BATCH_SIZE=50`).
//!
//! Resource capacities are consumed here, not owned: the orchestration
//! platform supplies the per-constraint capacity map as part of deployment
//! configuration.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CAS_RETRY_ATTEMPTS, DEFAULT_ITERATION_BACKOFF_SECS, DEFAULT_LEDGER_TTL_SECS,
    DEFAULT_POLL_BATCH_SIZE, DEFAULT_POLL_INTERVAL_SECS,
};
use crate::error::{CoordinationError, Result};

/// Poller cadence and batching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Seconds between poll passes
    pub poll_interval_secs: u64,
    /// Seconds added to `next_iteration_at` after every revisit
    pub iteration_backoff_secs: u64,
    /// Maximum due documents fetched per pass, per ledger
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            iteration_backoff_secs: DEFAULT_ITERATION_BACKOFF_SECS,
            batch_size: DEFAULT_POLL_BATCH_SIZE,
        }
    }
}

impl PollerConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    pub fn iteration_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.iteration_backoff_secs as i64)
    }
}

/// Ledger durability knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Hard TTL stamped on new ledger rows, in seconds
    pub ttl_secs: u64,
    /// Bounded optimistic-concurrency retries before surfacing a conflict
    pub cas_retry_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_LEDGER_TTL_SECS,
            cas_retry_attempts: DEFAULT_CAS_RETRY_ATTEMPTS,
        }
    }
}

impl LedgerConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// Top-level coordination configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub poller: PollerConfig,
    pub ledger: LedgerConfig,
    /// Per-unit capacity keyed by resource constraint id
    pub capacities: HashMap<String, u32>,
}

impl CoordinationConfig {
    /// Load configuration: defaults, then the optional TOML file, then
    /// environment overrides.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&CoordinationConfig::default()).map_err(map_config_err)?,
        );

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PIPELINE_COORD")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: CoordinationConfig = builder
            .build()
            .map_err(map_config_err)?
            .try_deserialize()
            .map_err(map_config_err)?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate the loaded values before handing them to the coordinators
    pub fn validate(&self) -> Result<()> {
        if self.poller.poll_interval_secs == 0 {
            return Err(validation("poller.poll_interval_secs", "must be at least 1"));
        }
        if self.poller.iteration_backoff_secs == 0 {
            return Err(validation(
                "poller.iteration_backoff_secs",
                "must be at least 1",
            ));
        }
        if self.poller.batch_size == 0 {
            return Err(validation("poller.batch_size", "must be at least 1"));
        }
        if self.ledger.cas_retry_attempts == 0 {
            return Err(validation("ledger.cas_retry_attempts", "must be at least 1"));
        }
        for (constraint_id, capacity) in &self.capacities {
            if *capacity == 0 {
                return Err(validation(
                    "capacities",
                    &format!("capacity for {constraint_id} must be at least 1"),
                ));
            }
        }
        Ok(())
    }

    /// Capacity configured for one resource constraint, if any
    pub fn capacity_for(&self, resource_constraint_id: &str) -> Option<u32> {
        self.capacities.get(resource_constraint_id).copied()
    }
}

fn validation(field: &str, reason: &str) -> CoordinationError {
    CoordinationError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn map_config_err(e: config::ConfigError) -> CoordinationError {
    CoordinationError::Configuration {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = CoordinationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poller.batch_size, DEFAULT_POLL_BATCH_SIZE);
        assert_eq!(config.ledger.cas_retry_attempts, DEFAULT_CAS_RETRY_ATTEMPTS);
        assert!(config.capacity_for("anything").is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = CoordinationConfig::default();
        config.capacities.insert("deploy-slots".to_string(), 0);
        assert!(config.validate().is_err());

        config.capacities.insert("deploy-slots".to_string(), 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity_for("deploy-slots"), Some(2));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = CoordinationConfig::default();
        config.poller.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
            [poller]
            poll_interval_secs = 2
            batch_size = 25

            [capacities]
            deploy-slots = 3
            "#
        )
        .unwrap();

        let config = CoordinationConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.poller.poll_interval_secs, 2);
        assert_eq!(config.poller.batch_size, 25);
        // Untouched sections keep their defaults
        assert_eq!(
            config.poller.iteration_backoff_secs,
            DEFAULT_ITERATION_BACKOFF_SECS
        );
        assert_eq!(config.capacity_for("deploy-slots"), Some(3));
    }

    #[test]
    fn missing_file_and_env_yields_defaults() {
        let config = CoordinationConfig::load(None).unwrap();
        assert_eq!(config, CoordinationConfig::default());
    }
}
