//! Rate limiting primitives.
//!
//! This module provides the building blocks for short-window admission control:
//! - [`RateLimiter`]: checks an identifier against a [`RateLimitRule`] using the shared store.
//! - [`RateLimitLayer`]: Tower middleware that enforces a rule per request.
//! - [`RateDecision`]: the result of a check, with header values for the transport layer.
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter`.
//! - **Logic**: one [`strategies::WindowStrategy`] per [`Algorithm`] (fixed window, sliding
//!   window, token bucket) handles the math.
//! - **Storage**: every check is a single atomic round-trip on the [`CounterStore`], so all
//!   process instances enforce one shared limit.
//!
//! The fixed window admits up to `2 × limit` across a window boundary; use the sliding window
//! when that matters.

use crate::clock::{Clock, SystemClock};
use crate::error::{Rejection, RejectionReason};
use crate::store::{CounterStore, FailureMode, SharedStore};
use crate::ResilienceError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod middleware;
pub mod strategies;
pub use middleware::{RateLimitLayer, RateLimitService};

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// Limit applied to one identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window: Duration,
    /// Token-bucket capacity multiplier (`capacity = limit × burst`).
    pub burst: Option<f64>,
    pub algorithm: Algorithm,
}

impl RateLimitRule {
    /// Fixed-window rule.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window, burst: None, algorithm: Algorithm::FixedWindow }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = Some(burst);
        self
    }
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests still admissible in the current window (tokens left for the bucket).
    pub remaining: u64,
    pub limit: u64,
    /// Requests counted in the current window, including this one when allowed.
    pub current: u64,
    /// Epoch milliseconds at which the window resets (or the bucket is full again).
    pub reset_at_millis: u64,
    /// Set when denied: how long until a request would be admitted.
    pub retry_after: Option<Duration>,
    /// The store was unreachable and the decision came from the failure mode.
    pub degraded: bool,
}

impl RateDecision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Reset time in whole epoch seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_millis.div_ceil(1_000)
    }

    /// `X-RateLimit-*` header values (plus `Retry-After` when denied).
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at_secs().to_string()),
        ];
        if let Some(after) = self.retry_after {
            headers.push(("Retry-After", after.as_millis().div_ceil(1_000).to_string()));
        }
        headers
    }

    pub fn rejection(&self) -> Rejection {
        let rejection = Rejection::new(
            RejectionReason::RateLimitExceeded,
            self.current,
            self.limit,
            self.remaining,
        );
        match self.retry_after {
            Some(after) => rejection.with_retry_after(after),
            None => rejection,
        }
    }

    fn from_failure_mode(mode: FailureMode, rule: &RateLimitRule, now: u64) -> Self {
        let allowed = mode == FailureMode::Open;
        Self {
            allowed,
            remaining: if allowed { rule.limit } else { 0 },
            limit: rule.limit,
            current: 0,
            reset_at_millis: now.saturating_add(crate::clock::duration_millis(rule.window)),
            retry_after: (!allowed).then_some(rule.window),
            degraded: true,
        }
    }
}

/// Checks identifiers against rules using the shared store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
}

impl RateLimiter {
    pub fn new(store: SharedStore) -> Self {
        Self { store, clock: Arc::new(SystemClock), failure_mode: FailureMode::Open }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Behaviour when the store is unreachable (default: fail open).
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Count one request for `identifier` and decide whether it is admitted.
    pub async fn check(&self, identifier: &str, rule: &RateLimitRule) -> RateDecision {
        let now = self.clock.now_millis();
        let strategy = strategies::for_algorithm(rule.algorithm);
        let store: &dyn CounterStore = self.store.as_ref();
        match strategy.check(store, identifier, rule, now).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(
                        identifier,
                        limit = decision.limit,
                        current = decision.current,
                        algorithm = ?rule.algorithm,
                        "rate limit exceeded"
                    );
                }
                decision
            }
            Err(err) => {
                tracing::warn!(
                    identifier,
                    error = %err,
                    mode = ?self.failure_mode,
                    "rate limit store unavailable"
                );
                RateDecision::from_failure_mode(self.failure_mode, rule, now)
            }
        }
    }

    /// [`RateLimiter::check`], turning a denial into `ResilienceError::RateLimited`.
    pub async fn enforce<E>(
        &self,
        identifier: &str,
        rule: &RateLimitRule,
    ) -> Result<RateDecision, ResilienceError<E>> {
        let decision = self.check(identifier, rule).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(ResilienceError::RateLimited(decision.rejection()))
        }
    }
}
