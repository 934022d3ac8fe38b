// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull windows and the scheduler that carves them out of the advancing time range.
//!
//! Windows are laid out back to back on a nominal grid starting at the resume
//! point. Each window's fetched range reaches `overlap` back into its
//! predecessor so that records landing near a boundary are pulled twice rather
//! than missed; the deduplicator removes the second copy.
//!
//! ```text
//!   resume                                            now - lag
//!     |-------- w0 --------|-------- w1 --------|--- w2 ---|
//!   [-o                    ]                               (fetched w0)
//!                       [-o                    ]           (fetched w1)
//!                                            [-o          ](fetched w2)
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

use crate::config::Config;

/// A half-open interval `[start, end)` requested from the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    /// Position in the dispatch order. Windows retire strictly by this number.
    pub seq: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{}, {})",
            self.seq,
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}

pub(crate) fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Where to start pulling when no checkpoint exists. `None` if the lookback
/// reaches outside the representable range.
pub fn initial_start(now: DateTime<Utc>, lookback: Duration) -> Option<DateTime<Utc>> {
    now.trunc_subsecs(0).checked_sub_signed(delta(lookback))
}

/// Produces contiguous windows covering `[cursor, now - safety_lag)`.
#[derive(Debug, Clone)]
pub struct WindowScheduler {
    /// Nominal start of the next window. Runs ahead of the checkpoint while
    /// windows are in flight.
    cursor: DateTime<Utc>,
    next_seq: u64,
    window_size: TimeDelta,
    overlap: TimeDelta,
    safety_lag: TimeDelta,
    min_window: TimeDelta,
}

impl WindowScheduler {
    pub fn new(resume_from: DateTime<Utc>, config: &Config) -> Self {
        WindowScheduler {
            cursor: resume_from,
            next_seq: 0,
            window_size: delta(config.window_size),
            overlap: delta(config.overlap),
            safety_lag: delta(config.safety_lag),
            min_window: delta(config.min_window),
        }
    }

    /// Latest instant that may be requested at `now`, truncated to whole seconds.
    pub fn horizon(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.safety_lag)
            .map(|horizon| horizon.trunc_subsecs(0))
    }

    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    /// Returns the next window, or `None` when caught up with the horizon.
    ///
    /// A trailing partial window is only produced once it reaches the API
    /// minimum; until then the caller should idle and poll again.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self, now: DateTime<Utc>) -> Option<TimeWindow> {
        let horizon = self.horizon(now)?;
        if horizon <= self.cursor {
            return None;
        }
        let end = self
            .cursor
            .checked_add_signed(self.window_size)
            .map_or(horizon, |end| end.min(horizon));
        if end - self.cursor < self.min_window {
            return None;
        }

        let window = TimeWindow {
            seq: self.next_seq,
            start: self.cursor.checked_sub_signed(self.overlap)?,
            end,
        };
        self.cursor = end;
        self.next_seq += 1;
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    fn config(window: u64, overlap: u64, lag: u64) -> Config {
        let mut config = Config::new("zone", "token");
        config.window_size = Duration::from_secs(window);
        config.overlap = Duration::from_secs(overlap);
        config.safety_lag = Duration::from_secs(lag);
        config
    }

    #[test]
    fn splits_gap_into_overlapping_windows() {
        let mut scheduler = WindowScheduler::new(ts(0), &config(3600, 60, 60));
        let now = ts(3 * 3600 + 60);

        let w0 = scheduler.next(now).expect("first window");
        let w1 = scheduler.next(now).expect("second window");
        let w2 = scheduler.next(now).expect("third window");
        assert_eq!(scheduler.next(now), None);

        assert_eq!((w0.seq, w0.start, w0.end), (0, ts(-60), ts(3600)));
        assert_eq!((w1.seq, w1.start, w1.end), (1, ts(3540), ts(7200)));
        assert_eq!((w2.seq, w2.start, w2.end), (2, ts(7140), ts(10800)));
        assert_eq!(w1.start, w0.end - TimeDelta::seconds(60));
        assert_eq!(scheduler.cursor(), ts(10800));
    }

    #[test]
    fn final_window_is_partial() {
        let mut scheduler = WindowScheduler::new(ts(0), &config(600, 10, 0));
        let now = ts(900);
        assert_eq!(scheduler.next(now).map(|w| w.end), Some(ts(600)));
        let partial = scheduler.next(now).expect("partial window");
        assert_eq!(partial.end, ts(900));
        assert_eq!(partial.span(), TimeDelta::seconds(310));
        assert_eq!(scheduler.next(now), None);
    }

    #[test]
    fn idles_until_minimum_window_is_available() {
        let mut cfg = config(600, 10, 0);
        cfg.min_window = Duration::from_secs(30);
        let mut scheduler = WindowScheduler::new(ts(0), &cfg);
        assert_eq!(scheduler.next(ts(29)), None);
        assert_eq!(scheduler.next(ts(0)), None);
        assert_eq!(scheduler.next(ts(-5)), None);
        let window = scheduler.next(ts(30)).expect("window at minimum length");
        assert_eq!(window.end, ts(30));
    }

    #[test]
    fn horizon_truncates_subseconds() {
        let scheduler = WindowScheduler::new(ts(0), &config(60, 5, 60));
        let now = ts(1000) + TimeDelta::milliseconds(750);
        assert_eq!(scheduler.horizon(now), Some(ts(940)));
    }

    #[test]
    fn initial_start_uses_lookback() {
        let now = ts(10_000) + TimeDelta::milliseconds(10);
        assert_eq!(initial_start(now, Duration::from_secs(3600)), Some(ts(6400)));
    }

    #[test]
    fn out_of_range_durations_do_not_panic() {
        let now = ts(10_000);
        assert_eq!(initial_start(now, Duration::from_secs(u64::MAX)), None);

        let scheduler_cfg = config(60, 5, u64::MAX);
        let mut scheduler = WindowScheduler::new(ts(0), &scheduler_cfg);
        assert_eq!(scheduler.horizon(now), None);
        assert_eq!(scheduler.next(now), None);

        let mut scheduler = WindowScheduler::new(DateTime::<Utc>::MIN_UTC, &config(60, 5, 0));
        assert_eq!(scheduler.next(now), None);
    }

    #[test]
    fn display() {
        let window = TimeWindow {
            seq: 4,
            start: ts(0),
            end: ts(60),
        };
        assert_eq!(
            window.to_string(),
            "#4 [1970-01-01T00:00:00+00:00, 1970-01-01T00:01:00+00:00)"
        );
    }
}
