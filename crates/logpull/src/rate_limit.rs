// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Account-wide request budget shared by every fetch worker.
//!
//! The Logpull quota is enforced per account, not per connection, so all
//! workers draw from one limiter. Workers hold an `Arc<RequestBudget>`; the
//! engine owns the only constructor call.

use std::fmt::Debug;
use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub struct RequestBudget {
    limiter: DirectLimiter,
    per_second: u32,
}

impl RequestBudget {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        RequestBudget {
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            per_second: rate.get(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.requests_per_second, config.request_burst)
    }

    pub fn per_second(&self) -> u32 {
        self.per_second
    }

    /// Waits for a request slot.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Waits for a request slot unless `cancel` fires first. Returns whether a slot was taken.
    pub async fn acquire_or_cancel(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.limiter.until_ready() => true,
        }
    }

    /// Takes a slot only if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Debug for RequestBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBudget")
            .field("per_second", &self.per_second)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn burst_is_shared() {
        let budget = Arc::new(RequestBudget::new(1, 2));
        let other = Arc::clone(&budget);
        assert!(budget.try_acquire());
        assert!(other.try_acquire());
        assert!(!budget.try_acquire());
        assert!(!other.try_acquire());
    }

    #[test]
    fn zero_rate_is_clamped() {
        let budget = RequestBudget::new(0, 0);
        assert_eq!(budget.per_second(), 1);
        assert!(budget.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_replenishment() {
        let budget = RequestBudget::new(20, 1);
        budget.acquire().await;
        let started = Instant::now();
        budget.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn cancellation_releases_waiter() {
        let budget = RequestBudget::new(1, 1);
        assert!(budget.try_acquire());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!budget.acquire_or_cancel(&cancel).await);
    }
}
