//! The due-post polling loop
//!
//! Every interval the poller optionally sweeps expiring tokens, queries a
//! batch of due posts and fans them out to the [`Dispatcher`], at most
//! `max_workers` at a time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulingConfig;
use crate::db::Database;
use crate::dispatcher::{DispatchOutcome, Dispatcher, PlatformOutcome};
use crate::error::Result;
use crate::refresh::TokenRefresher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Querying,
    Dispatching,
}

/// Tally of one polling cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Due posts returned by the query
    pub due: usize,
    /// Posts this worker claimed and dispatched
    pub dispatched: usize,
    /// Posts another worker claimed first
    pub skipped: usize,
    pub published: usize,
    pub failed: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    pub errors: usize,
    pub tokens_refreshed: usize,
}

impl CycleReport {
    fn add(&mut self, outcome: &DispatchOutcome) {
        if !outcome.claimed {
            self.skipped += 1;
            return;
        }
        self.dispatched += 1;
        for (_, platform_outcome) in &outcome.platforms {
            match platform_outcome {
                PlatformOutcome::Published => self.published += 1,
                PlatformOutcome::Failed => self.failed += 1,
                PlatformOutcome::RetryScheduled(_) => self.retrying += 1,
                PlatformOutcome::DeadLettered => self.dead_lettered += 1,
                PlatformOutcome::Errored => self.errors += 1,
                PlatformOutcome::Skipped => {}
            }
        }
    }
}

pub struct Poller {
    db: Database,
    dispatcher: Arc<Dispatcher>,
    refresher: Option<Arc<TokenRefresher>>,
    workers: Arc<Semaphore>,
    batch_size: u32,
    interval: Duration,
    shutdown_grace: Duration,
    state: watch::Sender<PollerState>,
}

impl Poller {
    pub fn new(db: Database, dispatcher: Arc<Dispatcher>, config: &SchedulingConfig) -> Self {
        let (state, _) = watch::channel(PollerState::Idle);
        Self {
            db,
            dispatcher,
            refresher: None,
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            batch_size: config.batch_size,
            interval: config.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
            state,
        }
    }

    /// Sweep expiring tokens at the start of every cycle
    pub fn with_token_sweep(mut self, refresher: Arc<TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(chrono::Utc::now().timestamp()).await
    }

    /// One cycle as of `now`: sweep, query, dispatch, wait
    pub async fn run_cycle_at(&self, now: i64) -> Result<CycleReport> {
        let result = self.cycle(now).await;
        self.state.send_replace(PollerState::Idle);
        result
    }

    async fn cycle(&self, now: i64) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        if let Some(refresher) = &self.refresher {
            match refresher.sweep(now).await {
                Ok(sweep) => report.tokens_refreshed = sweep.refreshed,
                Err(e) => tracing::warn!(error = %e, "Token sweep failed"),
            }
        }

        self.state.send_replace(PollerState::Querying);
        let posts = self.db.due_posts(now, self.batch_size).await?;
        report.due = posts.len();
        if posts.is_empty() {
            return Ok(report);
        }

        self.state.send_replace(PollerState::Dispatching);
        tracing::debug!(count = posts.len(), "Dispatching due posts");

        let mut tasks = JoinSet::new();
        for post in posts {
            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!("Worker pool closed, not dispatching the rest of the batch");
                    break;
                }
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            tasks.spawn(async move {
                let _permit = permit;
                dispatcher.dispatch_at(&post, now).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.add(&outcome),
                Ok(Err(e)) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "Dispatch failed");
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "Dispatch task panicked");
                }
            }
        }

        Ok(report)
    }

    /// Poll until `cancel` fires.
    ///
    /// On cancellation no new batch is pulled; an in-flight cycle gets the
    /// shutdown grace period to finish and is abandoned after that. Locks
    /// held by abandoned dispatches expire on their own.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Poller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle = self.run_cycle();
            tokio::pin!(cycle);

            let result = tokio::select! {
                biased;
                result = &mut cycle => result,
                _ = cancel.cancelled() => {
                    tracing::info!(
                        grace_secs = self.shutdown_grace.as_secs(),
                        "Shutdown requested, waiting for in-flight dispatches"
                    );
                    match tokio::time::timeout(self.shutdown_grace, &mut cycle).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!("Grace period elapsed, abandoning in-flight dispatches");
                            self.state.send_replace(PollerState::Idle);
                            break;
                        }
                    }
                }
            };

            match result {
                Ok(report) if report.due > 0 => {
                    tracing::info!(
                        due = report.due,
                        dispatched = report.dispatched,
                        skipped = report.skipped,
                        published = report.published,
                        failed = report.failed,
                        retrying = report.retrying,
                        dead_lettered = report.dead_lettered,
                        errors = report.errors,
                        "Poll cycle finished"
                    );
                }
                Ok(_) => tracing::trace!("Nothing due"),
                Err(e) => tracing::error!(error = %e, "Poll cycle failed"),
            }
        }

        tracing::info!("Poller stopped");
        Ok(())
    }
}
