//! Retry policy implementation
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Each attempt runs inside the configured circuit breaker (if any) and is bounded by the
//!   per-attempt timeout (if any). An open breaker fails the attempt fast without invoking the
//!   operation; that rejection is returned immediately.
//! - `ResilienceError::Inner(E)` is retried when the `should_retry` predicate (or the
//!   `retryable_kinds` list) accepts it; `Timeout` is retried unless disabled. Policy rejections
//!   are never retried.
//! - After the last attempt fails, `RetryExhausted` wraps that failure.
//! - The wait before attempt `n + 1` is `backoff.delay(n)`; the first attempt is immediate.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use tollgate::{Backoff, InstantSleeper, RetryPolicy, ResilienceError};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<MyErr>::builder()
//!     .max_attempts(3) // total attempts
//!     .backoff(Backoff::exponential_jitter(Duration::from_millis(100)))
//!     .should_retry(|_e| true)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<MyErr>> =
//!     policy.execute(|| async { Err(ResilienceError::Inner(MyErr)) }).await;
//! assert!(result.unwrap_err().is_retry_exhausted());
//! assert_eq!(policy.stats().total_attempts, 3);
//! # });
//! ```

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{FailureKind, TIMEOUT_KIND};
use crate::timeout::TimeoutPolicy;
use crate::{Backoff, ResilienceError, Sleeper, TokioSleeper};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Retry counters, shareable between policies (e.g. all routes of one service).
#[derive(Debug, Default)]
pub struct RetryStats {
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
    retry_successes: AtomicU64,
    retries_exhausted: AtomicU64,
}

/// Point-in-time copy of [`RetryStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatsSnapshot {
    pub total_attempts: u64,
    pub total_retries: u64,
    /// Executions that succeeded after at least one retry.
    pub retry_successes: u64,
    pub retries_exhausted: u64,
}

impl RetryStats {
    pub fn snapshot(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            retry_successes: self.retry_successes.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
        }
    }
}

/// What an attempt knows about its position in the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub attempt: usize,
    pub max_attempts: usize,
    /// Rendered failure of the previous attempt.
    pub last_failure: Option<String>,
}

/// Retry policy combining backoff, predicate, breaker, per-attempt timeout and sleeper.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    name: Option<Arc<str>>,
    max_attempts: usize,
    backoff: Backoff,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    retry_timeouts: bool,
    circuit_breaker: Option<CircuitBreaker>,
    attempt_timeout: Option<TimeoutPolicy>,
    sleeper: Arc<dyn Sleeper>,
    stats: Arc<RetryStats>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retry_timeouts", &self.retry_timeouts)
            .field("circuit_breaker", &self.circuit_breaker.as_ref().map(|b| b.name().to_string()))
            .field("attempt_timeout", &self.attempt_timeout)
            .field("sleeper", &"<sleeper>")
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Counters accumulated by every execution of this policy (and any sharing its stats).
    pub fn stats(&self) -> RetryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        self.execute_with_context(|_| operation()).await
    }

    /// Like [`RetryPolicy::execute`], handing each attempt its [`AttemptContext`].
    pub async fn execute_with_context<T, Fut, Op>(
        &self,
        mut operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut(AttemptContext) -> Fut,
    {
        let mut last_failure: Option<String> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.stats.total_attempts.fetch_add(1, Ordering::Relaxed);
            if attempt > 1 {
                self.stats.total_retries.fetch_add(1, Ordering::Relaxed);
            }

            let context = AttemptContext {
                attempt,
                max_attempts: self.max_attempts,
                last_failure: last_failure.take(),
            };
            match self.attempt(|| operation(context)).await {
                Ok(value) => {
                    if attempt > 1 {
                        self.stats.retry_successes.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !self.is_retryable(&err) {
                        return Err(err);
                    }

                    if attempt >= self.max_attempts {
                        self.stats.retries_exhausted.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            operation = self.name.as_deref().unwrap_or("-"),
                            attempts = attempt,
                            error = %err,
                            "retries exhausted"
                        );
                        return Err(ResilienceError::retry_exhausted(attempt, err));
                    }

                    let delay = self.backoff.delay(attempt);
                    tracing::debug!(
                        operation = self.name.as_deref().unwrap_or("-"),
                        attempt,
                        max_attempts = self.max_attempts,
                        ?delay,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    last_failure = Some(err.to_string());
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let bounded = async {
            match &self.attempt_timeout {
                Some(timeout) => timeout.execute(operation).await,
                None => operation().await,
            }
        };
        match &self.circuit_breaker {
            Some(breaker) => breaker.call(|| bounded).await,
            None => bounded.await,
        }
    }

    fn is_retryable(&self, err: &ResilienceError<E>) -> bool {
        match err {
            ResilienceError::Inner(e) => (self.should_retry)(e),
            ResilienceError::Timeout { .. } => self.retry_timeouts,
            _ => false,
        }
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    name: Option<Arc<str>>,
    max_attempts: usize,
    backoff: Backoff,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    retry_timeouts: bool,
    circuit_breaker: Option<CircuitBreaker>,
    attempt_timeout: Option<TimeoutPolicy>,
    sleeper: Arc<dyn Sleeper>,
    stats: Arc<RetryStats>,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a builder with sane defaults.
    pub fn new() -> Self {
        Self {
            name: None,
            max_attempts: 3,
            backoff: Backoff::exponential_jitter(Duration::from_secs(1)),
            should_retry: Arc::new(|_| true),
            retry_timeouts: true,
            circuit_breaker: None,
            attempt_timeout: None,
            sleeper: Arc::new(TokioSleeper),
            stats: Arc::new(RetryStats::default()),
        }
    }

    /// Operation name used in log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(Arc::from(name.into()));
        self
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set backoff strategy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Predicate to decide if an `Inner` error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Whether per-attempt timeouts are retried (default: true).
    pub fn retry_timeouts(mut self, retry: bool) -> Self {
        self.retry_timeouts = retry;
        self
    }

    /// Run every attempt through `breaker`.
    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Bound every attempt by `timeout`.
    pub fn attempt_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Accumulate counters into `stats` instead of a private instance.
    pub fn stats(mut self, stats: Arc<RetryStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            name: self.name,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            should_retry: self.should_retry,
            retry_timeouts: self.retry_timeouts,
            circuit_breaker: self.circuit_breaker,
            attempt_timeout: self.attempt_timeout,
            sleeper: self.sleeper,
            stats: self.stats,
        })
    }
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + FailureKind + Send + Sync + 'static,
{
    /// Retry only failures whose [`FailureKind::kind`] is listed. Listing `"timeout"` also
    /// controls whether per-attempt timeouts are retried.
    pub fn retryable_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kinds: HashSet<String> = kinds.into_iter().map(Into::into).collect();
        self.retry_timeouts = kinds.contains(TIMEOUT_KIND);
        self.should_retry = Arc::new(move |e: &E| kinds.contains(e.kind()));
        self
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::store::InMemoryCounterStore;
    use crate::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    impl FailureKind for TestError {
        fn kind(&self) -> &str {
            self.0.split(':').next().unwrap_or_default()
        }
    }

    fn fail(msg: &str) -> ResilienceError<TestError> {
        ResilienceError::Inner(TestError(msg.to_string()))
    }

    #[tokio::test]
    async fn success_first_attempt() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::constant(Duration::from_millis(100)))
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "Should only execute once");
        assert_eq!(policy.stats().total_retries, 0);
    }

    #[tokio::test]
    async fn succeeds_on_last_attempt_and_records_retries() {
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .backoff(Backoff::constant(Duration::from_millis(10)))
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(fail(&format!("attempt {}", attempt)))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(
            policy.stats(),
            RetryStatsSnapshot {
                total_attempts: 4,
                total_retries: 3,
                retry_successes: 1,
                retries_exhausted: 0
            }
        );
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_failure() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::constant(Duration::from_millis(10)))
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(fail(&format!("attempt {}", attempt)))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 3, "Should attempt 3 times");
        match result.unwrap_err() {
            ResilienceError::RetryExhausted { attempts, last_failure } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_failure.as_inner().unwrap().0, "attempt 2");
            }
            e => panic!("Expected RetryExhausted, got {:?}", e),
        }
        assert_eq!(policy.stats().retries_exhausted, 1);
    }

    #[tokio::test]
    async fn backoff_applied_between_attempts() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(4)
            .backoff(Backoff::exponential(Duration::from_millis(100)))
            .with_sleeper(sleeper.clone())
            .build()
            .expect("builder");

        let _ = policy.execute(|| async { Err::<(), _>(fail("always")) }).await;

        // Exponential: 100ms, 200ms, 400ms; no wait before the first attempt.
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
        );
    }

    #[tokio::test]
    async fn should_retry_predicate_short_circuits() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .should_retry(|e: &TestError| e.0.contains("retryable"))
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();

        let result = policy
            .execute(|| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(fail("fatal"))
                }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Inner(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "should not retry");
    }

    #[tokio::test]
    async fn retryable_kinds_filter_failures() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .retryable_kinds(["connection"])
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let result = policy
            .execute(|| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(fail("validation: bad input"))
                }
            })
            .await;
        assert!(result.unwrap_err().is_inner());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        attempts.store(0, Ordering::SeqCst);
        let result = policy
            .execute(|| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(fail("connection: reset"))
                }
            })
            .await;
        assert!(result.unwrap_err().is_retry_exhausted());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn per_attempt_timeout_is_retried() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .attempt_timeout(TimeoutPolicy::new(Duration::from_millis(50)).unwrap())
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let result = policy
            .execute(|| {
                let seen = seen.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok::<_, ResilienceError<TestError>>("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_not_retried_when_kind_is_unlisted() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .retryable_kinds(["connection"])
            .attempt_timeout(TimeoutPolicy::new(Duration::from_millis(5)).unwrap())
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let result = policy
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_retry() {
        let store = Arc::new(InMemoryCounterStore::new());
        let breaker = CircuitBreaker::new(
            "inventory",
            store,
            CircuitBreakerConfig::new(2, 1, Duration::from_secs(60)).unwrap(),
        );
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .circuit_breaker(breaker.clone())
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let result = policy
            .execute(|| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(fail("down"))
                }
            })
            .await;

        // Two failures open the breaker; the third attempt is rejected without running.
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn attempts_see_their_context() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .with_sleeper(InstantSleeper)
            .build()
            .expect("builder");

        let result = policy
            .execute_with_context(|ctx| async move {
                if ctx.attempt < 3 {
                    Err(fail(&format!("try {}", ctx.attempt)))
                } else {
                    Ok(ctx)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.max_attempts, 3);
        assert_eq!(result.last_failure.as_deref(), Some("TestError: try 2"));
    }

    #[tokio::test]
    async fn builder_rejects_zero_attempts() {
        let err = RetryPolicy::<TestError>::builder().max_attempts(0).build();
        assert!(matches!(err, Err(BuildError::InvalidMaxAttempts(0))));
    }
}
