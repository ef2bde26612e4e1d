//! # System Constants
//!
//! Operational defaults and the structured-log event vocabulary for the
//! coordination core. Everything here can be overridden through
//! [`crate::config::CoordinationConfig`]; these are the values used when no
//! configuration is supplied.

/// Default polling cadence of the ledger poller, in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default re-iteration backoff applied after every revisit, in seconds.
///
/// A permanently stuck row is revisited at this bounded frequency rather
/// than hot-looped.
pub const DEFAULT_ITERATION_BACKOFF_SECS: u64 = 30;

/// Default number of due documents fetched per poll pass
pub const DEFAULT_POLL_BATCH_SIZE: usize = 100;

/// Default hard TTL for ledger rows, in seconds (24 hours).
///
/// Reaching it force-finishes a permit or force-clears a barrier and is
/// always logged as an operational alert.
pub const DEFAULT_LEDGER_TTL_SECS: u64 = 24 * 60 * 60;

/// Bounded retry attempts for optimistic-concurrency conflicts before a
/// `CoordinationError::Conflict` is surfaced
pub const DEFAULT_CAS_RETRY_ATTEMPTS: u32 = 5;

/// Structured-log event names emitted by the coordinators
pub mod events {
    // Resource constraint lifecycle
    pub const PERMIT_REQUESTED: &str = "resource.permit_requested";
    pub const PERMIT_ACTIVATED: &str = "resource.permit_activated";
    pub const PERMIT_RELEASED: &str = "resource.permit_released";
    pub const PERMIT_EXPIRED: &str = "resource.permit_expired";

    // Barrier lifecycle
    pub const BARRIER_CREATED: &str = "barrier.created";
    pub const BARRIER_ARRIVAL: &str = "barrier.arrival";
    pub const BARRIER_DOWN: &str = "barrier.down";
    pub const BARRIER_FORCE_CLEARED: &str = "barrier.force_cleared";
    pub const BARRIER_EXPIRED: &str = "barrier.expired";

    // Poller lifecycle
    pub const POLL_PASS_STARTED: &str = "poller.pass_started";
    pub const POLL_REVISIT_FAILED: &str = "poller.revisit_failed";
}
