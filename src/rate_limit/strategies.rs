//! One strategy per rate limiting [`Algorithm`].
//!
//! Each strategy turns a rule into exactly one atomic store call and derives the decision from
//! its result; none of them read-then-write, so concurrent callers never over-admit.

use crate::clock::duration_millis;
use crate::rate_limit::{Algorithm, RateDecision, RateLimitRule};
use crate::store::{BucketSpec, CounterStore, StoreError};
use async_trait::async_trait;
use std::time::Duration;

/// Rate limiting math for one algorithm.
#[async_trait]
pub trait WindowStrategy: Send + Sync + std::fmt::Debug {
    /// Count one request for `identifier` at `now_millis` and decide.
    async fn check(
        &self,
        store: &dyn CounterStore,
        identifier: &str,
        rule: &RateLimitRule,
        now_millis: u64,
    ) -> Result<RateDecision, StoreError>;
}

/// Strategy implementing `algorithm`.
pub fn for_algorithm(algorithm: Algorithm) -> &'static dyn WindowStrategy {
    match algorithm {
        Algorithm::FixedWindow => &FixedWindow,
        Algorithm::SlidingWindow => &SlidingWindow,
        Algorithm::TokenBucket => &TokenBucket,
    }
}

/// Counter per `floor(now / window)` at `ratelimit:{id}:{windowIndex}`, expiring with the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWindow;

#[async_trait]
impl WindowStrategy for FixedWindow {
    async fn check(
        &self,
        store: &dyn CounterStore,
        identifier: &str,
        rule: &RateLimitRule,
        now_millis: u64,
    ) -> Result<RateDecision, StoreError> {
        let window_ms = duration_millis(rule.window).max(1);
        let index = now_millis / window_ms;
        let key = format!("ratelimit:{identifier}:{index}");

        let count = store.increment(&key, 1, Some(rule.window)).await?;
        let count = u64::try_from(count).unwrap_or(0);
        let allowed = count <= rule.limit;
        let reset_at_millis = index.saturating_add(1).saturating_mul(window_ms);

        Ok(RateDecision {
            allowed,
            remaining: rule.limit.saturating_sub(count),
            limit: rule.limit,
            current: count,
            reset_at_millis,
            retry_after: (!allowed)
                .then(|| Duration::from_millis(reset_at_millis.saturating_sub(now_millis))),
            degraded: false,
        })
    }
}

/// Timestamp log of admitted requests in the trailing window at `ratelimit:{id}:sliding`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindow;

#[async_trait]
impl WindowStrategy for SlidingWindow {
    async fn check(
        &self,
        store: &dyn CounterStore,
        identifier: &str,
        rule: &RateLimitRule,
        now_millis: u64,
    ) -> Result<RateDecision, StoreError> {
        let key = format!("ratelimit:{identifier}:sliding");
        let window_ms = duration_millis(rule.window).max(1);

        let log = store.record_event(&key, now_millis, rule.window, rule.limit).await?;
        // The oldest admitted request leaves the window at `oldest + window`.
        let reset_at_millis = log.oldest_millis.unwrap_or(now_millis).saturating_add(window_ms);

        Ok(RateDecision {
            allowed: log.allowed,
            remaining: rule.limit.saturating_sub(log.count),
            limit: rule.limit,
            current: if log.allowed { log.count } else { log.count.saturating_add(1) },
            reset_at_millis,
            retry_after: (!log.allowed)
                .then(|| Duration::from_millis(reset_at_millis.saturating_sub(now_millis))),
            degraded: false,
        })
    }
}

/// Refillable bucket at `ratelimit:{id}:bucket`.
///
/// Capacity is `limit × burst` (burst defaults to 1) and the bucket refills at
/// `limit / window` tokens per second.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucket;

impl TokenBucket {
    fn spec(rule: &RateLimitRule) -> BucketSpec {
        let limit = rule.limit as f64;
        let capacity = limit * rule.burst.unwrap_or(1.0);
        let refill_per_sec = limit / rule.window.as_secs_f64().max(0.001);
        // Idle buckets expire once they would be full again anyway.
        let full_after = if refill_per_sec > 0.0 {
            Duration::from_secs_f64((capacity / refill_per_sec).min(86_400.0))
        } else {
            rule.window
        };
        BucketSpec { capacity, refill_per_sec, cost: 1.0, ttl: full_after.max(rule.window) }
    }
}

#[async_trait]
impl WindowStrategy for TokenBucket {
    async fn check(
        &self,
        store: &dyn CounterStore,
        identifier: &str,
        rule: &RateLimitRule,
        now_millis: u64,
    ) -> Result<RateDecision, StoreError> {
        let key = format!("ratelimit:{identifier}:bucket");
        let spec = Self::spec(rule);

        let state = store.take_tokens(&key, spec, now_millis).await?;
        let secs_until = |tokens_needed: f64| -> Duration {
            if spec.refill_per_sec <= 0.0 || tokens_needed <= 0.0 {
                return Duration::ZERO;
            }
            Duration::from_secs_f64((tokens_needed / spec.refill_per_sec).min(86_400.0))
        };
        let until_full = secs_until(spec.capacity - state.tokens);
        let capacity = spec.capacity.floor() as u64;

        Ok(RateDecision {
            allowed: state.allowed,
            remaining: state.tokens.floor().max(0.0) as u64,
            limit: capacity,
            current: capacity.saturating_sub(state.tokens.floor() as u64),
            reset_at_millis: now_millis.saturating_add(duration_millis(until_full)),
            retry_after: (!state.allowed).then(|| secs_until(spec.cost - state.tokens)),
            degraded: false,
        })
    }
}
