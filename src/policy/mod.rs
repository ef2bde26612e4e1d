//! # Failure Policy Evaluation
//!
//! Pure evaluation of configured [`crate::models::FailureStrategy`] documents
//! against failure events. No state, no storage: the caller supplies the
//! current attempt count and instance tallies, and gets a total
//! [`evaluator::Disposition`] back.

pub mod evaluator;

pub use evaluator::{decide, Disposition, FailureEvent};
