// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry state machine for a single in-flight request.
//!
//! ```text
//!   Pending ──ok──> Succeeded
//!      │
//!     err (retryable, budget left)
//!      v
//!   Retrying(attempt, next_delay) ──ok──> Succeeded
//!      │               ^
//!      │               └── err (retryable, budget left)
//!      └── err (permanent or budget spent) ──> PermanentlyFailed
//! ```
//!
//! Cancellation is checked before every attempt and while sleeping.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::errors::FetchError;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            min_backoff: config.min_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// Upper bound of the delay before retry number `retry` (1-based).
    pub fn ceiling(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.min_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry`: half of the ceiling plus up to another half at random.
    pub fn backoff(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        let half = ceiling / 2;
        half + half.mul_f64(fastrand::f64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    Retrying { attempt: u32, next_delay: Duration },
    Succeeded,
    PermanentlyFailed,
}

impl FetchState {
    /// Number of attempts made once the current one finishes.
    pub fn attempt(&self) -> u32 {
        match self {
            FetchState::Pending => 1,
            FetchState::Retrying { attempt, .. } => attempt.saturating_add(1),
            FetchState::Succeeded | FetchState::PermanentlyFailed => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchState::Succeeded | FetchState::PermanentlyFailed)
    }

    pub fn on_success(self) -> FetchState {
        FetchState::Succeeded
    }

    /// Transition after a failed attempt.
    pub fn on_error(self, err: &FetchError, policy: &RetryPolicy) -> FetchState {
        if self.is_terminal() || !err.is_retryable() {
            return FetchState::PermanentlyFailed;
        }
        let attempt = self.attempt();
        if attempt > policy.max_retries {
            return FetchState::PermanentlyFailed;
        }
        let mut next_delay = policy.backoff(attempt);
        if let FetchError::RateLimited {
            retry_after: Some(retry_after),
        } = err
        {
            next_delay = next_delay.max(*retry_after);
        }
        FetchState::Retrying {
            attempt,
            next_delay,
        }
    }
}

/// Drives `op` through the state machine until it succeeds, fails permanently or is cancelled.
///
/// A retryable error that outlives the retry budget is reported as
/// [`FetchError::Exhausted`]; permanent errors are returned unchanged.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut state = FetchState::Pending;
    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let attempt = state.attempt();
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        state = state.on_error(&err, policy);
        match state {
            FetchState::Retrying { next_delay, .. } => {
                debug!(
                    attempt,
                    delay_ms = next_delay.as_millis() as u64,
                    error = %err,
                    "retrying request"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = sleep(next_delay) => {}
                }
            }
            _ if err.is_retryable() => {
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            _ => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn ceiling_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.ceiling(4), Duration::from_millis(800));
        assert_eq!(policy.ceiling(5), Duration::from_secs(1));
        assert_eq!(policy.ceiling(200), Duration::from_secs(1));
        for retry in 1..8 {
            let delay = policy.backoff(retry);
            assert!(delay >= policy.ceiling(retry) / 2);
            assert!(delay <= policy.ceiling(retry));
        }
    }

    #[test]
    fn attempt_count_saturates() {
        let policy = fast_policy(u32::MAX);
        let state = FetchState::Retrying {
            attempt: u32::MAX,
            next_delay: Duration::ZERO,
        };
        assert_eq!(state.attempt(), u32::MAX);
        assert!(matches!(
            state.on_error(&FetchError::Server(503), &policy),
            FetchState::Retrying { attempt: u32::MAX, .. }
        ));
        assert!(policy.backoff(u32::MAX) <= policy.max_backoff);
    }

    #[test]
    fn state_transitions() {
        let policy = fast_policy(2);
        let transient = FetchError::Server(500);

        let state = FetchState::Pending.on_error(&transient, &policy);
        assert!(matches!(state, FetchState::Retrying { attempt: 1, .. }));
        let state = state.on_error(&transient, &policy);
        assert!(matches!(state, FetchState::Retrying { attempt: 2, .. }));
        assert_eq!(
            state.on_error(&transient, &policy),
            FetchState::PermanentlyFailed
        );

        let permanent = FetchError::Rejected {
            status: 403,
            body: String::new(),
        };
        assert_eq!(
            FetchState::Pending.on_error(&permanent, &policy),
            FetchState::PermanentlyFailed
        );
        assert_eq!(state.on_success(), FetchState::Succeeded);
    }

    #[test]
    fn retry_after_is_a_floor() {
        let policy = fast_policy(3);
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        match FetchState::Pending.on_error(&err, &policy) {
            FetchState::Retrying { next_delay, .. } => {
                assert_eq!(next_delay, Duration::from_secs(7))
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn recovers_from_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&calls);
        let result = run_with_retry(&fast_policy(3), &cancel, || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::Timeout)
                } else {
                    Ok("page")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("page"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_retry_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = run_with_retry(&fast_policy(2), &cancel, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Server(503)) }
        })
        .await;
        assert_eq!(
            result,
            Err(FetchError::Exhausted {
                attempts: 3,
                last: Box::new(FetchError::Server(503))
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = run_with_retry(&fast_policy(5), &cancel, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(FetchError::Rejected {
                    status: 400,
                    body: "bad start".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Rejected { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            min_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result: Result<(), _> = run_with_retry(&policy, &cancel, || {
            trigger.cancel();
            async { Err(FetchError::Timeout) }
        })
        .await;
        assert_eq!(result, Err(FetchError::Cancelled));
    }
}
