//! # Ledger Poller
//!
//! Generic periodic scan over any ledger that exposes "documents due for
//! re-iteration". Each pass loads due documents, dispatches them to the
//! owning coordinator's revisit entry point, and pushes
//! `next_iteration_at = now + backoff` regardless of outcome, so a
//! permanently stuck document is retried at bounded frequency instead of
//! hot-looped.
//!
//! Multiple poller instances may run across processes against the same
//! store. Dispatch is at-least-once; the revisit functions on the
//! coordinators are idempotent, and no lock is taken across a ledger.
//! Coordinators mutate through per-document optimistic writes only.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PollerConfig;
use crate::constants::events;
use crate::error::Result;

/// A ledger the poller can drive
#[async_trait]
pub trait IterationHandler: Send + Sync {
    /// Ledger name for log attribution
    fn ledger_name(&self) -> &'static str;

    /// Ids of documents whose `next_iteration_at` has elapsed, ascending
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>>;

    /// Re-evaluate one document; must be idempotent
    async fn revisit(&self, id: Uuid) -> Result<()>;

    /// Push the document's next poll time
    async fn reschedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Delete terminal documents whose validity window lapsed; returns the
    /// number removed
    async fn purge(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Counts from one poll pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollPassSummary {
    /// Documents dispatched this pass
    pub visited: usize,
    /// Revisits that returned an error (logged, rescheduled anyway)
    pub failed: usize,
    /// Terminal documents deleted this pass
    pub purged: u64,
}

/// Periodic scan driver over a set of ledgers
pub struct LedgerPoller {
    handlers: Vec<Arc<dyn IterationHandler>>,
    config: PollerConfig,
}

impl LedgerPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            handlers: Vec::new(),
            config,
        }
    }

    pub fn register(mut self, handler: Arc<dyn IterationHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Run one poll pass across all registered ledgers.
    ///
    /// Exposed separately from [`run`](Self::run) so tests and embedding
    /// engines can drive passes deterministically.
    pub async fn tick(&self, now: DateTime<Utc>) -> PollPassSummary {
        debug!(
            event = events::POLL_PASS_STARTED,
            handlers = self.handlers.len(),
            "Starting poll pass"
        );

        let passes = join_all(
            self.handlers
                .iter()
                .map(|handler| self.scan_handler(handler.as_ref(), now)),
        )
        .await;

        passes
            .into_iter()
            .fold(PollPassSummary::default(), |mut acc, pass| {
                acc.visited += pass.visited;
                acc.failed += pass.failed;
                acc.purged += pass.purged;
                acc
            })
    }

    async fn scan_handler(&self, handler: &dyn IterationHandler, now: DateTime<Utc>) -> PollPassSummary {
        let mut summary = PollPassSummary::default();

        // Housekeeping first, so a document that turns terminal during this
        // pass survives until the next one for diagnostics
        match handler.purge(now).await {
            Ok(purged) => {
                summary.purged = purged;
                if purged > 0 {
                    debug!(
                        ledger = handler.ledger_name(),
                        purged = purged,
                        "Purged terminal documents past their validity window"
                    );
                }
            }
            Err(e) => {
                warn!(
                    ledger = handler.ledger_name(),
                    error = %e,
                    "Purge failed; terminal documents retained until next pass"
                );
            }
        }

        let due = match handler.due(now, self.config.batch_size).await {
            Ok(due) => due,
            Err(e) => {
                warn!(
                    ledger = handler.ledger_name(),
                    error = %e,
                    "Due scan failed; skipping ledger this pass"
                );
                return summary;
            }
        };

        let next_at = now + self.config.iteration_backoff();
        for id in due {
            summary.visited += 1;
            if let Err(e) = handler.revisit(id).await {
                summary.failed += 1;
                warn!(
                    event = events::POLL_REVISIT_FAILED,
                    ledger = handler.ledger_name(),
                    document_id = %id,
                    error = %e,
                    "Revisit failed; document will be retried after backoff"
                );
            }
            // Rescheduled regardless of revisit outcome
            if let Err(e) = handler.reschedule(id, next_at).await {
                warn!(
                    ledger = handler.ledger_name(),
                    document_id = %id,
                    error = %e,
                    "Failed to reschedule document"
                );
            }
        }

        summary
    }

    /// Poll continuously until the shutdown signal flips to `true`.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick(Utc::now()).await;
                    if summary.visited > 0 {
                        debug!(
                            visited = summary.visited,
                            failed = summary.failed,
                            "Poll pass complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Ledger poller shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted handler recording dispatch behavior
    #[derive(Default)]
    struct RecordingHandler {
        due_ids: Mutex<Vec<Uuid>>,
        revisits: Mutex<Vec<Uuid>>,
        schedules: Mutex<HashMap<Uuid, DateTime<Utc>>>,
        /// Terminal documents the next purge call reports as removed
        purgeable: Mutex<u64>,
        fail_revisits: bool,
    }

    #[async_trait]
    impl IterationHandler for RecordingHandler {
        fn ledger_name(&self) -> &'static str {
            "recording"
        }

        async fn due(&self, _now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
            Ok(self.due_ids.lock().iter().take(limit).copied().collect())
        }

        async fn revisit(&self, id: Uuid) -> Result<()> {
            self.revisits.lock().push(id);
            if self.fail_revisits {
                return Err(crate::error::CoordinationError::PermitNotFound { instance_id: id });
            }
            Ok(())
        }

        async fn reschedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
            self.schedules.lock().insert(id, at);
            // Once rescheduled, the document is no longer due
            self.due_ids.lock().retain(|due| *due != id);
            Ok(())
        }

        async fn purge(&self, _now: DateTime<Utc>) -> Result<u64> {
            Ok(std::mem::take(&mut *self.purgeable.lock()))
        }
    }

    #[tokio::test]
    async fn tick_dispatches_and_reschedules() {
        let handler = Arc::new(RecordingHandler::default());
        let id = Uuid::new_v4();
        handler.due_ids.lock().push(id);

        let poller = LedgerPoller::new(PollerConfig::default()).register(handler.clone());
        let now = Utc::now();
        let summary = poller.tick(now).await;

        assert_eq!(summary, PollPassSummary { visited: 1, failed: 0, purged: 0 });
        assert_eq!(handler.revisits.lock().as_slice(), &[id]);
        let rescheduled_at = handler.schedules.lock()[&id];
        assert_eq!(rescheduled_at, now + PollerConfig::default().iteration_backoff());
    }

    #[tokio::test]
    async fn failed_revisit_still_reschedules() {
        let handler = Arc::new(RecordingHandler {
            fail_revisits: true,
            ..Default::default()
        });
        let id = Uuid::new_v4();
        handler.due_ids.lock().push(id);

        let poller = LedgerPoller::new(PollerConfig::default()).register(handler.clone());
        let summary = poller.tick(Utc::now()).await;

        assert_eq!(summary, PollPassSummary { visited: 1, failed: 1, purged: 0 });
        assert!(handler.schedules.lock().contains_key(&id));
    }

    #[tokio::test]
    async fn each_pass_purges_terminal_documents() {
        let handler = Arc::new(RecordingHandler::default());
        *handler.purgeable.lock() = 3;

        let poller = LedgerPoller::new(PollerConfig::default()).register(handler.clone());
        let first = poller.tick(Utc::now()).await;
        let second = poller.tick(Utc::now()).await;

        assert_eq!(first.purged, 3);
        assert_eq!(second.purged, 0);
    }

    #[tokio::test]
    async fn second_tick_on_unchanged_ledger_is_a_noop() {
        let handler = Arc::new(RecordingHandler::default());
        let id = Uuid::new_v4();
        handler.due_ids.lock().push(id);

        let poller = LedgerPoller::new(PollerConfig::default()).register(handler.clone());
        let first = poller.tick(Utc::now()).await;
        let second = poller.tick(Utc::now()).await;

        assert_eq!(first.visited, 1);
        assert_eq!(second.visited, 0);
        assert_eq!(handler.revisits.lock().len(), 1);
    }

    #[tokio::test]
    async fn batch_size_bounds_each_pass() {
        let handler = Arc::new(RecordingHandler::default());
        for _ in 0..5 {
            handler.due_ids.lock().push(Uuid::new_v4());
        }

        let config = PollerConfig {
            batch_size: 2,
            ..PollerConfig::default()
        };
        let poller = LedgerPoller::new(config).register(handler.clone());
        let summary = poller.tick(Utc::now()).await;

        assert_eq!(summary.visited, 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let poller = LedgerPoller::new(PollerConfig {
            poll_interval_secs: 1,
            ..PollerConfig::default()
        });
        let (tx, rx) = tokio::sync::watch::channel(false);

        let run = tokio::spawn(async move { poller.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("poller did not shut down")
            .unwrap();
    }
}
