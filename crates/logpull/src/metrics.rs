// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters reported by the engine as windows retire.
//!
//! Registration with an exporter is left to the embedder; it can read
//! [`Metrics::snapshot`] on its own schedule.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::constants::{ENTRIES_METRIC, LAST_END_METRIC};

/// Engine counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct Metrics {
    entries: AtomicU64,
    /// Unix seconds; zero until the first window retires.
    last_requested_end: AtomicI64,
    windows: AtomicU64,
    duplicates: AtomicU64,
    window_requeues: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a forwarded batch of `count` entries for a window ending at `end`.
    pub fn record_batch(&self, count: usize, end: DateTime<Utc>) {
        self.entries.fetch_add(count as u64, Ordering::Relaxed);
        self.last_requested_end
            .store(end.timestamp(), Ordering::Relaxed);
        self.windows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicates(&self, count: usize) {
        self.duplicates.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.window_requeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entries_total(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn last_requested_end(&self) -> i64 {
        self.last_requested_end.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_total: self.entries.load(Ordering::Relaxed),
            last_requested_end_timestamp: self.last_requested_end.load(Ordering::Relaxed),
            windows_total: self.windows.load(Ordering::Relaxed),
            duplicates_total: self.duplicates.load(Ordering::Relaxed),
            window_requeues_total: self.window_requeues.load(Ordering::Relaxed),
        }
    }
}

/// Plain data view of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub entries_total: u64,
    pub last_requested_end_timestamp: i64,
    pub windows_total: u64,
    pub duplicates_total: u64,
    pub window_requeues_total: u64,
}

impl MetricsSnapshot {
    /// The two exported series as `(name, value)` pairs.
    pub fn exported(&self) -> [(&'static str, f64); 2] {
        [
            (ENTRIES_METRIC, self.entries_total as f64),
            (LAST_END_METRIC, self.last_requested_end_timestamp as f64),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_accumulate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.last_requested_end(), 0);

        let end = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        metrics.record_batch(3, end);
        metrics.record_batch(0, end + chrono::TimeDelta::seconds(60));
        metrics.record_duplicates(2);
        metrics.record_requeue();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.entries_total, 3);
        assert_eq!(snapshot.last_requested_end_timestamp, 1_700_000_060);
        assert_eq!(snapshot.windows_total, 2);
        assert_eq!(snapshot.duplicates_total, 2);
        assert_eq!(snapshot.window_requeues_total, 1);
        assert_eq!(
            snapshot.exported(),
            [
                ("loki_source_cloudflare_target_entries_total", 3.0),
                (
                    "loki_source_cloudflare_target_last_requested_end_timestamp",
                    1_700_000_060.0
                ),
            ]
        );
    }
}
