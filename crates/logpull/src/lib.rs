// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Logpull
//!
//! A pull-based log source for the Cloudflare Logpull API.
//!
//! The API only serves logs by time range, so this crate walks the timeline
//! in fixed windows that trail wall-clock time by a safety lag:
//!
//! - [`window`]: carves `[checkpoint, now - lag)` into overlapping windows
//! - [`fetcher`]: pulls every page of a window under a shared [`RequestBudget`]
//!   and the [`retry`] state machine
//! - [`dedup`]: drops records pulled twice by the overlap
//! - [`forwarder`]: hands entries to a bounded downstream channel
//! - [`checkpoint`]: persists the last delivered window end
//! - [`engine`]: runs fetches concurrently and retires them in window order
//! - [`target`]: starts, observes and stops an engine
//!
//! Delivery is at least once. A restart re-delivers the overlap region and
//! any window that was forwarded but not yet checkpointed.

#![deny(clippy::all)]

pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod engine;
pub mod errors;
pub mod fetcher;
pub mod forwarder;
pub mod metrics;
pub mod rate_limit;
pub mod record;
pub mod reorder;
pub mod retry;
pub mod target;
pub mod window;

pub use checkpoint::{CheckpointError, CheckpointStore, MemoryCheckpoint, PositionsFile};
pub use config::{Config, ConfigError};
pub use engine::Engine;
pub use errors::{EngineError, FetchError, StartError};
pub use fetcher::{FetchResult, LogpullClient, PageFetcher};
pub use forwarder::{ForwardError, Forwarder};
pub use metrics::{Metrics, MetricsSnapshot};
pub use rate_limit::RequestBudget;
pub use record::{FieldsType, LogEntry, RawRecord};
pub use target::{LogpullHandle, LogpullTarget, TargetStatus};
pub use window::{TimeWindow, WindowScheduler};
