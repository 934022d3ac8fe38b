// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The pull loop.
//!
//! Windows are fetched by up to `workers` concurrent tasks and retired one at
//! a time in sequence order:
//!
//! ```text
//!  scheduler ──> JoinSet (fetch_window × workers) ──> ReorderBuffer
//!                                                          │ in order
//!                            dedup -> forward -> checkpoint -> metrics
//! ```
//!
//! Retirement runs on the loop itself, so a blocked forwarder stops both
//! retirement and dispatch. Windows waiting in the reorder buffer, in flight
//! or queued for a retry never exceed `2 * workers`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{Config, ConfigError};
use crate::dedup::Deduplicator;
use crate::errors::{EngineError, FetchError};
use crate::fetcher::{fetch_window, PageFetcher};
use crate::forwarder::{ForwardError, Forwarder};
use crate::metrics::Metrics;
use crate::rate_limit::RequestBudget;
use crate::record::{LogEntry, RawRecord};
use crate::reorder::ReorderBuffer;
use crate::retry::RetryPolicy;
use crate::window::{initial_start, TimeWindow, WindowScheduler};

type WorkerOutput = (TimeWindow, u32, Result<Vec<RawRecord>, FetchError>);

/// A window waiting out its backoff before being fetched again.
#[derive(Debug)]
struct Requeued {
    window: TimeWindow,
    attempt: u32,
    ready_at: Instant,
}

pub struct Engine {
    config: Config,
    fetcher: Arc<dyn PageFetcher>,
    budget: Arc<RequestBudget>,
    policy: RetryPolicy,
    store: Arc<dyn CheckpointStore>,
    forwarder: Forwarder,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    clock: fn() -> DateTime<Utc>,
}

impl Engine {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn CheckpointStore>,
        sink: mpsc::Sender<LogEntry>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        let budget = Arc::new(RequestBudget::from_config(&config));
        let policy = RetryPolicy::from_config(&config);
        let forwarder = Forwarder::new(sink, config.entry_labels());
        Engine {
            config,
            fetcher,
            budget,
            policy,
            store,
            forwarder,
            metrics,
            cancel,
            clock: Utc::now,
        }
    }

    /// Shares a request budget with other engines pulling under the same account.
    pub fn with_budget(mut self, budget: Arc<RequestBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Where pulling starts: the stored checkpoint, or the initial lookback.
    pub fn resume_point(&self) -> Result<DateTime<Utc>, EngineError> {
        match self.store.load()? {
            Some(checkpoint) => {
                info!(%checkpoint, "resuming from checkpoint");
                Ok(checkpoint)
            }
            None => {
                let start = initial_start((self.clock)(), self.config.initial_lookback)
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "initial lookback {:?} is out of range",
                            self.config.initial_lookback
                        ))
                    })?;
                info!(%start, lookback = ?self.config.initial_lookback, "no checkpoint, starting from lookback");
                Ok(start)
            }
        }
    }

    /// Pulls until cancelled or a fatal error.
    pub async fn run(self) -> Result<(), EngineError> {
        self.config.validate()?;
        let resume = self.resume_point()?;
        self.drive(resume, false).await
    }

    /// Pulls up to the current horizon, then returns.
    pub async fn backfill(self) -> Result<(), EngineError> {
        self.config.validate()?;
        let resume = self.resume_point()?;
        self.drive(resume, true).await
    }

    async fn drive(&self, resume: DateTime<Utc>, until_caught_up: bool) -> Result<(), EngineError> {
        let workers = self.config.workers.max(1);
        let max_outstanding = workers * 2;
        let mut scheduler = WindowScheduler::new(resume, &self.config);
        let mut in_flight: JoinSet<WorkerOutput> = JoinSet::new();
        let mut reorder: ReorderBuffer<(TimeWindow, Vec<RawRecord>)> = ReorderBuffer::new(0);
        let mut requeued: Vec<Requeued> = Vec::new();
        let mut dedup = Deduplicator::new(self.config.overlap);

        debug!(workers, %resume, "engine started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            while let Some((_, (window, records))) = reorder.pop_ready() {
                if !self.retire(&mut dedup, window, records).await? {
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let now = Instant::now();
            let mut caught_up = false;
            while in_flight.len() < workers {
                if let Some(idx) = requeued.iter().position(|r| r.ready_at <= now) {
                    let r = requeued.swap_remove(idx);
                    self.dispatch(&mut in_flight, r.window, r.attempt);
                    continue;
                }
                if in_flight.len() + reorder.len() + requeued.len() >= max_outstanding {
                    break;
                }
                match scheduler.next((self.clock)()) {
                    Some(window) => self.dispatch(&mut in_flight, window, 1),
                    None => {
                        caught_up = true;
                        break;
                    }
                }
            }

            if until_caught_up
                && caught_up
                && in_flight.is_empty()
                && reorder.is_empty()
                && requeued.is_empty()
            {
                info!(checkpoint = %scheduler.cursor(), "caught up with horizon");
                break;
            }

            let wake = requeued
                .iter()
                .map(|r| r.ready_at)
                .min()
                .unwrap_or(now + self.config.poll_interval);

            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => joined,
                _ = sleep_until(wake) => continue,
            };
            let (window, attempt, result) = match joined {
                Ok(output) => output,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => return Err(EngineError::Worker(e.to_string())),
            };
            let fatal = match result {
                Ok(records) => {
                    reorder.insert(window.seq, (window, records));
                    continue;
                }
                Err(FetchError::Cancelled) => continue,
                Err(err @ FetchError::Exhausted { .. })
                    if attempt < self.config.max_window_attempts =>
                {
                    let delay = self.window_backoff(attempt);
                    warn!(%window, attempt, ?delay, error = %err, "requeueing window");
                    self.metrics.record_requeue();
                    requeued.push(Requeued {
                        window,
                        attempt: attempt.saturating_add(1),
                        ready_at: Instant::now() + delay,
                    });
                    continue;
                }
                Err(err @ FetchError::Exhausted { .. }) => {
                    error!(%window, attempt, error = %err, "window retries exhausted, halting");
                    EngineError::WindowExhausted {
                        window,
                        attempts: attempt,
                        source: err,
                    }
                }
                Err(err) => {
                    error!(%window, error = %err, "window failed permanently, halting");
                    EngineError::WindowFailed { window, source: err }
                }
            };

            if let Err(e) = self
                .settle(window.seq, &mut in_flight, &mut reorder, &requeued, &mut dedup)
                .await
            {
                warn!(error = %e, "could not retire windows ahead of the failure");
            }
            return Err(fatal);
        }

        in_flight.abort_all();
        info!(retired = reorder.next_expected(), "engine stopped");
        Ok(())
    }

    fn dispatch(&self, in_flight: &mut JoinSet<WorkerOutput>, window: TimeWindow, attempt: u32) {
        debug!(%window, attempt, "dispatching window");
        let fetcher = Arc::clone(&self.fetcher);
        let budget = Arc::clone(&self.budget);
        let policy = self.policy;
        let cancel = self.cancel.clone();
        in_flight.spawn(async move {
            let result = fetch_window(fetcher.as_ref(), &budget, &policy, &cancel, window).await;
            (window, attempt, result)
        });
    }

    fn window_backoff(&self, attempt: u32) -> Duration {
        // Windows back off from the top of the page backoff range.
        self.policy
            .backoff(self.policy.max_retries.saturating_add(attempt))
    }

    /// Retires the windows ahead of `failed` before the engine halts, so the
    /// checkpoint ends right before the failing window. Stops early if one of
    /// them is itself failing or waiting for a retry.
    async fn settle(
        &self,
        failed: u64,
        in_flight: &mut JoinSet<WorkerOutput>,
        reorder: &mut ReorderBuffer<(TimeWindow, Vec<RawRecord>)>,
        requeued: &[Requeued],
        dedup: &mut Deduplicator,
    ) -> Result<(), EngineError> {
        loop {
            while let Some((_, (window, records))) = reorder.pop_ready() {
                if !self.retire(dedup, window, records).await? {
                    return Ok(());
                }
            }
            if reorder.next_expected() >= failed
                || requeued.iter().any(|r| r.window.seq < failed)
            {
                return Ok(());
            }

            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                joined = in_flight.join_next() => joined,
            };
            match joined {
                None => return Ok(()),
                Some(Ok((window, _, Ok(records)))) => {
                    reorder.insert(window.seq, (window, records));
                }
                Some(Ok((window, _, Err(_)))) if window.seq < failed => return Ok(()),
                Some(_) => {}
            }
        }
    }

    /// Dedups, forwards and checkpoints one window. Returns `false` when
    /// cancelled before the batch was delivered.
    async fn retire(
        &self,
        dedup: &mut Deduplicator,
        window: TimeWindow,
        records: Vec<RawRecord>,
    ) -> Result<bool, EngineError> {
        let fetched = records.len();
        let records = dedup.retire(&window, records);
        let duplicates = fetched - records.len();
        if duplicates > 0 {
            self.metrics.record_duplicates(duplicates);
        }

        match self.forwarder.forward(&records, &self.cancel).await {
            Ok(_) => {}
            Err(ForwardError::Cancelled { sent }) => {
                debug!(%window, sent, "retirement interrupted by shutdown");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let store = Arc::clone(&self.store);
        let end = window.end;
        tokio::task::spawn_blocking(move || store.advance(end))
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))??;
        self.metrics.record_batch(records.len(), window.end);
        debug!(
            %window,
            entries = records.len(),
            duplicates,
            tracked = dedup.len(),
            "window retired"
        );
        Ok(true)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("zone_id", &self.config.zone_id)
            .field("workers", &self.config.workers)
            .field("budget", &self.budget)
            .finish()
    }
}
