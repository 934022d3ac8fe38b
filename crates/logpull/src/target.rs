// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of one zone's pull: start, observe, stop.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use logpull::{Config, LogpullTarget};
//! use tokio::sync::mpsc;
//!
//! let (tx, mut rx) = mpsc::channel(1024);
//! let handle = LogpullTarget::new(Config::new("zone-id", "api-token"))?.start(tx);
//! while let Some(entry) = rx.recv().await {
//!     println!("{}", entry.line);
//! }
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointStore, MemoryCheckpoint, PositionsFile};
use crate::config::Config;
use crate::engine::Engine;
use crate::errors::{EngineError, StartError};
use crate::fetcher::{LogpullClient, PageFetcher};
use crate::metrics::Metrics;
use crate::rate_limit::RequestBudget;
use crate::record::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Starting,
    Running,
    Stopped,
    Failed(String),
}

impl TargetStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TargetStatus::Stopped | TargetStatus::Failed(_))
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::Starting => f.write_str("starting"),
            TargetStatus::Running => f.write_str("running"),
            TargetStatus::Stopped => f.write_str("stopped"),
            TargetStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

pub struct LogpullTarget {
    config: Config,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn CheckpointStore>,
    metrics: Arc<Metrics>,
    budget: Option<Arc<RequestBudget>>,
}

impl LogpullTarget {
    /// Validates `config`, builds the API client and opens the positions file.
    ///
    /// Without a positions path progress is kept in memory only.
    pub fn new(config: Config) -> Result<Self, StartError> {
        config.validate()?;
        let fetcher: Arc<dyn PageFetcher> = Arc::new(LogpullClient::new(&config)?);
        let store: Arc<dyn CheckpointStore> = match &config.positions_path {
            Some(path) => Arc::new(PositionsFile::open(path, config.position_key())?),
            None => {
                warn!("no positions file configured, progress will not survive a restart");
                Arc::new(MemoryCheckpoint::new())
            }
        };
        Ok(LogpullTarget {
            config,
            fetcher,
            store,
            metrics: Arc::new(Metrics::new()),
            budget: None,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shares `budget` with other targets under the same account.
    pub fn with_budget(mut self, budget: Arc<RequestBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Spawns the engine onto the current runtime. Entries are sent to `sink` in window order.
    pub fn start(self, sink: mpsc::Sender<LogEntry>) -> LogpullHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(TargetStatus::Starting);
        let zone_id = self.config.zone_id.clone();

        let mut engine = Engine::new(
            self.config,
            self.fetcher,
            self.store,
            sink,
            self.metrics,
            cancel.clone(),
        );
        if let Some(budget) = self.budget {
            engine = engine.with_budget(budget);
        }

        let task = tokio::spawn(async move {
            status_tx.send_replace(TargetStatus::Running);
            info!(zone_id, "logpull target running");
            let result = engine.run().await;
            match &result {
                Ok(()) => {
                    info!(zone_id, "logpull target stopped");
                    status_tx.send_replace(TargetStatus::Stopped);
                }
                Err(e) => {
                    error!(zone_id, error = %e, "logpull target failed");
                    status_tx.send_replace(TargetStatus::Failed(e.to_string()));
                }
            }
            result
        });

        LogpullHandle {
            cancel,
            status: status_rx,
            task,
        }
    }
}

impl fmt::Debug for LogpullTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogpullTarget")
            .field("zone_id", &self.config.zone_id)
            .finish_non_exhaustive()
    }
}

/// Controls a running target.
#[derive(Debug)]
pub struct LogpullHandle {
    cancel: CancellationToken,
    status: watch::Receiver<TargetStatus>,
    task: JoinHandle<Result<(), EngineError>>,
}

impl LogpullHandle {
    pub fn status(&self) -> TargetStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TargetStatus> {
        self.status.clone()
    }

    /// Token that stops the target when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels in-flight fetches and waits for the engine to exit.
    pub async fn stop(self) -> Result<(), EngineError> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Waits for the engine to exit on its own.
    pub async fn wait(self) -> Result<(), EngineError> {
        self.task
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?
    }
}
