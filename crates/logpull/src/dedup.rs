// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Suppression of records pulled twice by overlapping windows.
//!
//! Only identifiers whose timestamp can still fall inside a future window's
//! fetched range are kept. With window `k+1` starting at `k.end - overlap`,
//! anything older than that boundary cannot be fetched again, so the set is
//! bounded by the number of records in one overlap interval rather than by
//! the length of the stream.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use tracing::trace;

use crate::record::RawRecord;
use crate::window::{delta, TimeWindow};

#[derive(Debug)]
pub struct Deduplicator {
    /// Identifier to record timestamp.
    seen: HashMap<String, DateTime<Utc>, FnvBuildHasher>,
    overlap: TimeDelta,
    /// Identifiers older than this have been evicted.
    boundary: Option<DateTime<Utc>>,
}

impl Deduplicator {
    pub fn new(overlap: Duration) -> Self {
        Deduplicator {
            seen: HashMap::with_hasher(FnvBuildHasher::default()),
            overlap: delta(overlap),
            boundary: None,
        }
    }

    /// Drops records whose identifier was already emitted, preserving order.
    pub fn filter(&mut self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            if self.seen.contains_key(&record.id) {
                trace!(id = %record.id, "dropping duplicate record");
                continue;
            }
            self.seen.insert(record.id.clone(), record.timestamp);
            out.push(record);
        }
        out
    }

    /// Forgets identifiers that no window after one ending at `window_end` can return.
    pub fn evict(&mut self, window_end: DateTime<Utc>) -> usize {
        let boundary = window_end - self.overlap;
        let before = self.seen.len();
        self.seen.retain(|_, ts| *ts >= boundary);
        self.boundary = Some(boundary);
        before - self.seen.len()
    }

    /// Filters a completed window's records, then evicts up to its end.
    pub fn retire(&mut self, window: &TimeWindow, records: Vec<RawRecord>) -> Vec<RawRecord> {
        let out = self.filter(records);
        self.evict(window.end);
        out
    }

    pub fn boundary(&self) -> Option<DateTime<Utc>> {
        self.boundary
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
