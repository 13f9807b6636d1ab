//! Progressive-delay admission control.
//!
//! The throttler never rejects. Requests beyond `threshold` in the current window are delayed by
//! `min(base_delay × 2^(requests - threshold), max_delay)` before they proceed, so a noisy client
//! slows down instead of failing. Requests are counted per fixed window at
//! `throttle:{id}:{windowIndex}`, the same way the fixed-window rate limiter counts them.

use crate::backoff::{Backoff, BackoffError};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::SharedStore;
use std::sync::Arc;
use std::time::Duration;

/// Result of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThrottleDecision {
    pub is_throttled: bool,
    /// Wait imposed before the request proceeds.
    pub delay: Duration,
    pub requests_in_window: u64,
}

/// Delays requests from identifiers that exceed a soft threshold.
#[derive(Debug, Clone)]
pub struct Throttler {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    schedule: Backoff,
}

impl Throttler {
    /// `base_delay` doubles per request over the threshold, capped at `max_delay`.
    pub fn new(
        store: SharedStore,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, BackoffError> {
        let schedule = Backoff::exponential(base_delay).with_max(max_delay)?;
        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            schedule,
        })
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Count one request and compute the delay it should wait. Does not sleep.
    pub async fn check(&self, identifier: &str, threshold: u64, window: Duration) -> ThrottleDecision {
        let now = self.clock.now_millis();
        let index = now / duration_millis(window).max(1);
        let key = format!("throttle:{identifier}:{index}");

        let requests = match self.store.increment(&key, 1, Some(window)).await {
            Ok(count) => u64::try_from(count).unwrap_or(0),
            Err(err) => {
                tracing::warn!(identifier, error = %err, "throttle store unavailable; not delaying");
                return ThrottleDecision::default();
            }
        };

        if requests <= threshold {
            return ThrottleDecision { is_throttled: false, delay: Duration::ZERO, requests_in_window: requests };
        }

        let over = usize::try_from(requests - threshold).unwrap_or(usize::MAX);
        // exponential(base).delay(k + 1) == base × 2^k
        let delay = self.schedule.base_delay(over.saturating_add(1));
        ThrottleDecision { is_throttled: true, delay, requests_in_window: requests }
    }

    /// [`Throttler::check`], then wait out the delay.
    pub async fn throttle(&self, identifier: &str, threshold: u64, window: Duration) -> ThrottleDecision {
        let decision = self.check(identifier, threshold, window).await;
        if decision.is_throttled {
            tracing::debug!(
                identifier,
                requests = decision.requests_in_window,
                threshold,
                delay = ?decision.delay,
                "throttling request"
            );
            self.sleeper.sleep(decision.delay).await;
        }
        decision
    }
}
