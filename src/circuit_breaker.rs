//! Store-backed circuit breaker shared by every process instance.
//!
//! The breaker for dependency `name` lives at `circuit:{name}` as a JSON [`CircuitRecord`].
//! Every mutation is a read-modify-`compare_and_set` loop whose transition function is pure and
//! idempotent, so concurrent successes and failures from many callers converge on the same state.
//!
//! Transitions:
//! - Closed → Open when `consecutive_failures >= failure_threshold`
//! - Open → HalfOpen at the first admission after `open_timeout` has elapsed since the last
//!   state change
//! - HalfOpen → Closed when `consecutive_successes >= success_threshold`
//! - HalfOpen → Open on any failure
//!
//! When the store is unreachable the breaker keeps protecting the dependency from a local,
//! single-process copy of the last record it saw, and reports itself as degraded.

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::store::{SharedStore, StoreError};
use crate::ResilienceError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Bounded optimistic-update attempts before the store is treated as unavailable.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operating mode.
    #[default]
    Closed,
    /// Short-circuits calls until the open timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

/// Persisted breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub last_failure_at: Option<u64>,
    pub last_state_change_at: u64,
}

impl CircuitRecord {
    fn closed_at(now: u64) -> Self {
        Self { last_state_change_at: now, ..Self::default() }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0")]
    InvalidFailureThreshold,
    #[error("success_threshold must be > 0")]
    InvalidSuccessThreshold,
    #[error("open_timeout must be > 0")]
    InvalidOpenTimeout,
    #[error("half_open_max_calls must be > 0")]
    InvalidHalfOpenLimit,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u64,
    success_threshold: u64,
    open_timeout: Duration,
    half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            half_open_max_calls: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation. The half-open trial cap defaults to
    /// `success_threshold`.
    pub fn new(
        failure_threshold: u64,
        success_threshold: u64,
        open_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold);
        }
        if success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold);
        }
        if open_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidOpenTimeout);
        }
        let half_open_max_calls = usize::try_from(success_threshold).unwrap_or(usize::MAX);
        Ok(Self { failure_threshold, success_threshold, open_timeout, half_open_max_calls })
    }

    /// Override the per-process cap on concurrent half-open trial calls; must be > 0.
    pub fn with_half_open_limit(mut self, limit: usize) -> Result<Self, CircuitBreakerError> {
        if limit == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit);
        }
        self.half_open_max_calls = limit;
        Ok(self)
    }

    /// Threshold before opening from Closed.
    pub fn failure_threshold(&self) -> u64 {
        self.failure_threshold
    }

    /// Consecutive half-open successes required to close.
    pub fn success_threshold(&self) -> u64 {
        self.success_threshold
    }

    /// Duration to stay Open before Half-Open probes.
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Maximum concurrent calls while Half-Open (per process).
    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }
}

/// Counters and configuration exposed by [`CircuitBreaker::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub last_failure_at: Option<u64>,
    pub last_state_change_at: u64,
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub open_timeout_ms: u64,
    /// True while the breaker runs from its local fallback.
    pub degraded: bool,
}

/// Open → HalfOpen once the timeout has elapsed; `None` leaves the record untouched.
fn admit_transition(
    record: &CircuitRecord,
    config: &CircuitBreakerConfig,
    now: u64,
) -> Option<CircuitRecord> {
    if record.state != CircuitState::Open {
        return None;
    }
    let elapsed = now.saturating_sub(record.last_state_change_at);
    if elapsed < duration_millis(config.open_timeout) {
        return None;
    }
    Some(CircuitRecord {
        state: CircuitState::HalfOpen,
        consecutive_failures: 0,
        consecutive_successes: 0,
        last_failure_at: record.last_failure_at,
        last_state_change_at: now,
    })
}

fn outcome_transition(
    record: &CircuitRecord,
    success: bool,
    config: &CircuitBreakerConfig,
    now: u64,
) -> CircuitRecord {
    let mut next = record.clone();
    if success {
        next.consecutive_successes = next.consecutive_successes.saturating_add(1);
        next.consecutive_failures = 0;
    } else {
        next.consecutive_failures = next.consecutive_failures.saturating_add(1);
        next.consecutive_successes = 0;
        next.last_failure_at = Some(now);
    }
    evaluate(next, config, now)
}

/// Re-evaluating an already evaluated record returns it unchanged.
fn evaluate(mut record: CircuitRecord, config: &CircuitBreakerConfig, now: u64) -> CircuitRecord {
    match record.state {
        CircuitState::Closed if record.consecutive_failures >= config.failure_threshold => {
            record.state = CircuitState::Open;
            record.consecutive_successes = 0;
            record.last_state_change_at = now;
        }
        CircuitState::HalfOpen if record.consecutive_failures > 0 => {
            record.state = CircuitState::Open;
            record.consecutive_successes = 0;
            record.last_state_change_at = now;
        }
        CircuitState::HalfOpen if record.consecutive_successes >= config.success_threshold => {
            record = CircuitRecord {
                last_failure_at: record.last_failure_at,
                ..CircuitRecord::closed_at(now)
            };
        }
        _ => {}
    }
    record
}

fn log_transition(name: &str, before: CircuitState, after: &CircuitRecord, threshold: u64) {
    if before == after.state {
        return;
    }
    match (before, after.state) {
        (CircuitState::HalfOpen, CircuitState::Open) => {
            tracing::warn!(name = %name, "Circuit breaker: trial failed → open");
        }
        (_, CircuitState::Open) => tracing::error!(
            name = %name,
            failures = after.consecutive_failures,
            threshold,
            "Circuit breaker → open"
        ),
        (_, CircuitState::HalfOpen) => tracing::info!(name = %name, "Circuit breaker → half-open"),
        (_, CircuitState::Closed) => tracing::info!(name = %name, "Circuit breaker → closed"),
    }
}

struct HalfOpenGuard {
    calls: Arc<AtomicUsize>,
}

impl Drop for HalfOpenGuard {
    fn drop(&mut self) {
        self.calls.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Circuit breaker guarding calls to one named dependency.
///
/// Clones share the local fallback and the half-open slot counter; separate instances (or
/// processes) with the same name and store share everything else through the store.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    key: Arc<str>,
    store: SharedStore,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    local: Arc<Mutex<CircuitRecord>>,
    degraded: Arc<AtomicBool>,
    half_open_calls: Arc<AtomicUsize>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, store: SharedStore, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            key: Arc::from(format!("circuit:{name}")),
            name: Arc::from(name),
            store,
            config,
            clock: Arc::new(SystemClock),
            local: Arc::new(Mutex::new(CircuitRecord::default())),
            degraded: Arc::new(AtomicBool::new(false)),
            half_open_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Executes `operation` under circuit breaker protection.
    ///
    /// While Open (and before the timeout elapses) the operation is not invoked and
    /// `ResilienceError::CircuitOpen` is returned. Otherwise the operation's result is returned
    /// unchanged after recording it. Policy rejections returned by the operation itself are
    /// passed through without counting as failures.
    pub async fn call<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let guard = match self.admit().await {
            Ok(guard) => guard,
            Err(rejected) => return Err(rejected.into_error()),
        };

        let result = operation().await;
        drop(guard);

        match &result {
            Ok(_) => self.record_success().await,
            Err(e) if !e.is_policy_rejection() => self.record_failure().await,
            Err(_) => {}
        }
        result
    }

    async fn admit(&self) -> Result<Option<HalfOpenGuard>, Rejected> {
        let now = self.clock.now_millis();
        let config = self.config;
        let record = self.apply(|r| admit_transition(r, &config, now)).await;

        match record.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let elapsed = now.saturating_sub(record.last_state_change_at);
                let remaining = duration_millis(self.config.open_timeout).saturating_sub(elapsed);
                Err(self.rejected(&record, Duration::from_millis(remaining)))
            }
            CircuitState::HalfOpen => {
                let in_flight = self.half_open_calls.fetch_add(1, Ordering::AcqRel);
                if in_flight >= self.config.half_open_max_calls {
                    self.half_open_calls.fetch_sub(1, Ordering::AcqRel);
                    return Err(self.rejected(&record, Duration::ZERO));
                }
                tracing::debug!(
                    name = %self.name,
                    in_flight = in_flight + 1,
                    max = self.config.half_open_max_calls,
                    "Circuit breaker: half-open test request"
                );
                Ok(Some(HalfOpenGuard { calls: self.half_open_calls.clone() }))
            }
        }
    }

    fn rejected(&self, record: &CircuitRecord, retry_after: Duration) -> Rejected {
        Rejected {
            name: self.name.to_string(),
            failure_count: record.consecutive_failures,
            threshold: self.config.failure_threshold,
            retry_after,
        }
    }

    /// Record a successful call made outside [`CircuitBreaker::call`].
    pub async fn record_success(&self) {
        let now = self.clock.now_millis();
        let config = self.config;
        self.apply(|r| Some(outcome_transition(r, true, &config, now))).await;
    }

    /// Record a failed call made outside [`CircuitBreaker::call`].
    pub async fn record_failure(&self) {
        let now = self.clock.now_millis();
        let config = self.config;
        self.apply(|r| Some(outcome_transition(r, false, &config, now))).await;
    }

    /// Persisted state; an Open breaker whose timeout elapsed still reports Open until the next
    /// call moves it to HalfOpen.
    pub async fn state(&self) -> CircuitState {
        self.record().await.state
    }

    pub async fn stats(&self) -> CircuitStats {
        let record = self.record().await;
        CircuitStats {
            name: self.name.to_string(),
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            consecutive_successes: record.consecutive_successes,
            last_failure_at: record.last_failure_at,
            last_state_change_at: record.last_state_change_at,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_timeout_ms: duration_millis(self.config.open_timeout),
            degraded: self.degraded.load(Ordering::Acquire),
        }
    }

    /// Force the breaker back to Closed with cleared counters.
    pub async fn reset(&self) {
        let fresh = CircuitRecord::closed_at(self.clock.now_millis());
        *self.local_record() = fresh.clone();
        match serde_json::to_string(&fresh) {
            Ok(json) => match self.store.set(&self.key, json, None).await {
                Ok(()) => self.mark_healthy(),
                Err(err) => self.mark_degraded(&err),
            },
            Err(err) => tracing::error!(name = %self.name, error = %err, "failed to encode circuit record"),
        }
        tracing::info!(name = %self.name, "Circuit breaker reset → closed");
    }

    async fn record(&self) -> CircuitRecord {
        match self.store.get(&self.key).await {
            Ok(raw) => {
                self.mark_healthy();
                let record = self.decode(raw.as_deref());
                *self.local_record() = record.clone();
                record
            }
            Err(err) => {
                self.mark_degraded(&err);
                self.local_record().clone()
            }
        }
    }

    /// Apply `transition` through the store, or locally when the store fails.
    async fn apply<F>(&self, transition: F) -> CircuitRecord
    where
        F: Fn(&CircuitRecord) -> Option<CircuitRecord> + Send + Sync,
    {
        match self.apply_shared(&transition).await {
            Ok((before, after)) => {
                self.mark_healthy();
                log_transition(&self.name, before, &after, self.config.failure_threshold);
                *self.local_record() = after.clone();
                after
            }
            Err(err) => {
                self.mark_degraded(&err);
                let mut local = self.local_record();
                let before = local.state;
                if let Some(next) = transition(&*local) {
                    *local = next;
                }
                log_transition(&self.name, before, &*local, self.config.failure_threshold);
                local.clone()
            }
        }
    }

    async fn apply_shared<F>(&self, transition: &F) -> Result<(CircuitState, CircuitRecord), StoreError>
    where
        F: Fn(&CircuitRecord) -> Option<CircuitRecord> + Send + Sync,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.store.get(&self.key).await?;
            let current = self.decode(raw.as_deref());
            let Some(next) = transition(&current) else {
                return Ok((current.state, current));
            };
            let encoded = serde_json::to_string(&next)
                .map_err(|e| StoreError::Corrupt { key: self.key.to_string(), reason: e.to_string() })?;
            if self.store.compare_and_set(&self.key, raw.as_deref(), encoded, None).await? {
                return Ok((current.state, next));
            }
        }
        tracing::warn!(name = %self.name, attempts = MAX_CAS_ATTEMPTS, "circuit record update kept racing");
        Err(StoreError::Unavailable(format!("write contention on {}", self.key)))
    }

    fn decode(&self, raw: Option<&str>) -> CircuitRecord {
        match raw {
            None => CircuitRecord::default(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|err| {
                tracing::warn!(name = %self.name, error = %err, "corrupt circuit record; treating as closed");
                CircuitRecord::default()
            }),
        }
    }

    fn local_record(&self) -> std::sync::MutexGuard<'_, CircuitRecord> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_degraded(&self, err: &StoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                name = %self.name,
                error = %err,
                "circuit store unavailable; using local fallback"
            );
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!(name = %self.name, "circuit store reachable again");
        }
    }
}

/// Short-circuit details, converted into `ResilienceError::CircuitOpen` for the caller's error
/// type.
#[derive(Debug)]
struct Rejected {
    name: String,
    failure_count: u64,
    threshold: u64,
    retry_after: Duration,
}

impl Rejected {
    fn into_error<E>(self) -> ResilienceError<E> {
        ResilienceError::CircuitOpen {
            name: self.name,
            failure_count: self.failure_count,
            threshold: self.threshold,
            retry_after: self.retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{CounterStore, InMemoryCounterStore};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn setup(
        failures: u64,
        successes: u64,
        open_timeout: Duration,
    ) -> (CircuitBreaker, InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::at_secs(1_000);
        let store = InMemoryCounterStore::with_clock(clock.clone());
        let config = CircuitBreakerConfig::new(failures, successes, open_timeout).unwrap();
        let breaker =
            CircuitBreaker::new("payments", Arc::new(store.clone()), config).with_clock(clock.clone());
        (breaker, store, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError<TestError>> {
        breaker.call(|| async { Err(ResilienceError::Inner(TestError("fail".into()))) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, ResilienceError<TestError>> {
        breaker.call(|| async { Ok(42) }).await
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(
            CircuitBreakerConfig::new(0, 1, Duration::from_secs(1)),
            Err(CircuitBreakerError::InvalidFailureThreshold)
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 0, Duration::from_secs(1)),
            Err(CircuitBreakerError::InvalidSuccessThreshold)
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 1, Duration::ZERO),
            Err(CircuitBreakerError::InvalidOpenTimeout)
        );
        let err = CircuitBreakerConfig::new(1, 1, Duration::from_secs(1))
            .and_then(|c| c.with_half_open_limit(0))
            .unwrap_err();
        assert_eq!(err, CircuitBreakerError::InvalidHalfOpenLimit);
    }

    #[test]
    fn evaluate_is_idempotent() {
        let config = CircuitBreakerConfig::new(3, 2, Duration::from_secs(5)).unwrap();
        let record = CircuitRecord { consecutive_failures: 3, ..CircuitRecord::default() };
        let once = evaluate(record, &config, 10);
        let twice = evaluate(once.clone(), &config, 20);
        assert_eq!(once.state, CircuitState::Open);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let (breaker, _, _) = setup(3, 1, Duration::from_secs(30));

        for _ in 0..2 {
            assert!(fail(&breaker).await.unwrap_err().is_inner());
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let (breaker, _, _) = setup(3, 1, Duration::from_secs(30));

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn open_circuit_does_not_invoke_operation() {
        let (breaker, _, clock) = setup(1, 1, Duration::from_secs(30));
        fail(&breaker).await.unwrap_err();

        clock.advance(Duration::from_secs(10));
        let invoked = Arc::new(AtomicUsize::new(0));
        let seen = invoked.clone();
        let result = breaker
            .call(|| async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await;

        match result.unwrap_err() {
            ResilienceError::CircuitOpen { name, failure_count, retry_after, .. } => {
                assert_eq!(name, "payments");
                assert_eq!(failure_count, 1);
                assert_eq!(retry_after, Duration::from_secs(20));
            }
            e => panic!("expected CircuitOpen, got {e:?}"),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_open_trial_success_closes() {
        let (breaker, _, clock) = setup(2, 2, Duration::from_secs(5));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        clock.advance(Duration::from_secs(5));
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let (breaker, _, clock) = setup(2, 2, Duration::from_secs(5));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        clock.advance(Duration::from_secs(6));
        succeed(&breaker).await.unwrap();
        let err = fail(&breaker).await.unwrap_err();
        assert_eq!(err.as_inner(), Some(&TestError("fail".into())), "original error is kept");

        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn policy_rejections_from_operation_do_not_count() {
        let (breaker, _, _) = setup(1, 1, Duration::from_secs(5));
        let result = breaker
            .call(|| async {
                Err::<(), _>(ResilienceError::<TestError>::IdempotencyConflict { key: "k".into() })
            })
            .await;
        assert!(result.unwrap_err().is_idempotency_conflict());
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn instances_sharing_a_store_share_state() {
        let (breaker, store, clock) = setup(2, 1, Duration::from_secs(30));
        let other = CircuitBreaker::new("payments", Arc::new(store.clone()), *breaker.config())
            .with_clock(clock.clone());

        fail(&breaker).await.unwrap_err();
        fail(&other).await.unwrap_err();

        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(succeed(&other).await.unwrap_err().is_circuit_open());

        let raw = store.get("circuit:payments").await.unwrap().unwrap();
        let record: CircuitRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert!(raw.contains("\"OPEN\""));
    }

    #[tokio::test]
    async fn falls_back_to_local_state_when_store_is_down() {
        let (breaker, store, _) = setup(2, 1, Duration::from_secs(30));
        fail(&breaker).await.unwrap_err();

        store.set_available(false);
        fail(&breaker).await.unwrap_err();
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());

        let stats = breaker.stats().await;
        assert!(stats.degraded);
        assert_eq!(stats.state, CircuitState::Open);

        store.set_available(true);
        assert!(!breaker.stats().await.degraded);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let (breaker, _, _) = setup(1, 1, Duration::from_secs(300));
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state().await, CircuitState::Open);

        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_trials() {
        let (breaker, _, clock) = setup(1, 1, Duration::from_secs(5));
        fail(&breaker).await.unwrap_err();
        clock.advance(Duration::from_secs(5));

        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trial = breaker.clone();
        let handle = tokio::spawn(async move {
            trial
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, ResilienceError<TestError>>(1)
                })
                .await
        });

        started_rx.await.unwrap();
        let second = succeed(&breaker).await;
        assert!(second.unwrap_err().is_circuit_open(), "second trial must be rejected");

        release_tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn stats_serialize_camel_case() {
        let (breaker, _, _) = setup(4, 2, Duration::from_secs(30));
        let json = serde_json::to_value(breaker.stats().await).unwrap();
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["failureThreshold"], 4);
        assert_eq!(json["openTimeoutMs"], 30_000);
    }
}
