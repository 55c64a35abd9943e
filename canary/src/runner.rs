//! Drives canary cycles at a fixed interval.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::canary::CanarySession;
use crate::error::CanaryResult;

/// Scheduling parameters of a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunnerOptions {
    /// Pause between the end of one cycle and the start of the next.
    pub interval: Duration,
    /// Total run time. `None` runs until interrupted.
    pub time_limit: Option<Duration>,
}

/// Why a run ended without error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// The time limit was reached.
    TimeLimit,
    /// Shutdown was requested.
    Interrupted,
}

/// Summary of a finished run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunOutcome {
    pub reason: StopReason,
    /// Number of cycles that completed successfully.
    pub cycles: u64,
}

/// Runs [`CanarySession::test_sequence`] repeatedly, one cycle at a time.
///
/// The time limit is checked only after a cycle completed: a cycle in progress always runs to
/// completion or failure. Cancelling the shutdown token stops scheduling at the next cycle
/// boundary, including during the sleep between cycles, after which the canary bucket is cleaned
/// up. A failed cycle is not retried; the store is cleaned up on a best-effort basis and the
/// error is returned.
#[derive(Debug)]
pub struct Runner {
    session: CanarySession,
    options: RunnerOptions,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(session: CanarySession, options: RunnerOptions, shutdown: CancellationToken) -> Self {
        Self {
            session,
            options,
            shutdown,
        }
    }

    pub async fn run(mut self) -> CanaryResult<RunOutcome> {
        // a deadline beyond the clock's range is never reached
        let deadline = self
            .options
            .time_limit
            .and_then(|limit| Instant::now().checked_add(limit));

        let reason = loop {
            if self.shutdown.is_cancelled() {
                break StopReason::Interrupted;
            }

            if let Err(err) = self.session.test_sequence().await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    step = %err.step(),
                    "canary cycle failed"
                );
                self.abort().await;
                return Err(err);
            }

            // the next cycle would not start before the deadline
            if let Some(deadline) = deadline
                && Instant::now()
                    .checked_add(self.options.interval)
                    .is_none_or(|next| next >= deadline)
            {
                break StopReason::TimeLimit;
            }

            tracing::debug!("waiting for next test iteration");
            tokio::select! {
                _ = self.shutdown.cancelled() => break StopReason::Interrupted,
                _ = tokio::time::sleep(self.options.interval) => {}
            }
        };

        if reason == StopReason::Interrupted {
            tracing::info!("Cleaning up");
            if let Err(err) = self.session.clean_up().await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to clean up after interrupt"
                );
                self.session.metrics().log_summary();
                return Err(err);
            }
        }

        self.session.close().await?;
        self.session.metrics().log_summary();

        Ok(RunOutcome {
            reason,
            cycles: self.session.metrics().cycles(),
        })
    }

    async fn abort(&mut self) {
        if let Err(err) = self.session.clean_up().await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to clean up after failed cycle"
            );
        }
        if let Err(err) = self.session.close().await {
            tracing::warn!(error = &err as &dyn std::error::Error, "failed to close store");
        }
        self.session.metrics().log_summary();
    }
}

#[cfg(test)]
mod tests {
    use crate::canary::CanaryOptions;
    use crate::metrics::Step;
    use crate::store::in_memory::{InMemoryStore, Operation};

    use super::*;

    async fn runner(
        store: &InMemoryStore,
        interval_secs: u64,
        time_limit_mins: Option<u64>,
        shutdown: CancellationToken,
    ) -> Runner {
        let options = CanaryOptions {
            bucket: "canary".into(),
            object_size: 16,
            object_count: 3,
        };
        let session = CanarySession::open_with_seed(Box::new(store.clone()), options, 99)
            .await
            .unwrap();

        let options = RunnerOptions {
            interval: Duration::from_secs(interval_secs),
            time_limit: time_limit_mins.map(|mins| Duration::from_secs(mins * 60)),
        };
        Runner::new(session, options, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn one_minute_limit_runs_one_cycle() {
        let store = InMemoryStore::new();
        let runner = runner(&store, 60, Some(1), CancellationToken::new()).await;

        let outcome = runner.run().await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome {
                reason: StopReason::TimeLimit,
                cycles: 1
            }
        );
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_is_checked_after_each_cycle() {
        let store = InMemoryStore::new();
        let runner = runner(&store, 60, Some(5), CancellationToken::new()).await;

        let start = Instant::now();
        let outcome = runner.run().await.unwrap();

        // cycles start at 0, 60, 120, 180 and 240 seconds
        assert_eq!(outcome.cycles, 5);
        assert_eq!(outcome.reason, StopReason::TimeLimit);
        assert_eq!(start.elapsed(), Duration::from_secs(240));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_during_sleep_stops_scheduling() {
        let store = InMemoryStore::new();
        let shutdown = CancellationToken::new();
        let runner = runner(&store, 60, None, shutdown.clone()).await;

        let stray = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            stray.insert_object("canary", "STRAY000", "x");
            shutdown.cancel();
        });

        let start = Instant::now();
        let outcome = runner.run().await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome {
                reason: StopReason::Interrupted,
                cycles: 2
            }
        );
        assert_eq!(start.elapsed(), Duration::from_secs(90));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_interval_stops_at_time_limit() {
        let store = InMemoryStore::new();
        let mut runner = runner(&store, 60, Some(1), CancellationToken::new()).await;
        runner.options.interval = Duration::from_secs(u64::MAX);

        let outcome = runner.run().await.unwrap();

        assert_eq!(outcome.cycles, 1);
        assert_eq!(outcome.reason, StopReason::TimeLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_time_limit_runs_until_interrupted() {
        let store = InMemoryStore::new();
        let shutdown = CancellationToken::new();
        let mut runner = runner(&store, 60, None, shutdown.clone()).await;
        runner.options.time_limit = Some(Duration::MAX);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(150)).await;
            shutdown.cancel();
        });

        let outcome = runner.run().await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome {
                reason: StopReason::Interrupted,
                cycles: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_before_start_cleans_up() {
        let store = InMemoryStore::new();
        let shutdown = CancellationToken::new();
        let runner = runner(&store, 60, None, shutdown.clone()).await;

        // a bucket appears after the session was opened
        store.insert_object("canary", "STRAY000", "x");
        shutdown.cancel();

        let outcome = runner.run().await.unwrap();

        assert_eq!(outcome.cycles, 0);
        assert_eq!(outcome.reason, StopReason::Interrupted);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_terminates_run() {
        let store = InMemoryStore::new();
        store.fail_after(Operation::GetObject, 0);
        let runner = runner(&store, 60, None, CancellationToken::new()).await;

        let err = runner.run().await.unwrap_err();

        assert_eq!(err.step(), Step::ReadObject);
        assert!(store.is_empty());
        assert!(store.close_count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_in_later_cycle_is_not_retried() {
        let store = InMemoryStore::new();
        store.fail_after(Operation::CreateBucket, 2);
        let runner = runner(&store, 60, None, CancellationToken::new()).await;

        let start = Instant::now();
        let err = runner.run().await.unwrap_err();

        assert_eq!(err.step(), Step::CreateBucket);
        assert_eq!(start.elapsed(), Duration::from_secs(120));
        assert!(store.is_empty());
    }
}
