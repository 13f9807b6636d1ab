//! Shared counter store.
//!
//! Every policy in this crate keeps its state in a [`CounterStore`] so that all process instances
//! of a horizontally scaled deployment agree on counts, buckets, circuit state, quota usage and
//! idempotency records. Each trait method is a single atomic round-trip against the backend; a
//! networked implementation (Redis with Lua scripts, for example) maps each method onto one
//! script or command.
//!
//! [`InMemoryCounterStore`] is the in-process implementation used for single-node deployments
//! and tests. It honours TTLs against an injected [`Clock`] and can be switched offline to
//! exercise the fail-open paths of every policy.

use crate::clock::{duration_millis, Clock, SystemClock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Errors surfaced by a [`CounterStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The key holds a value of a different shape than the operation expects.
    #[error("key '{key}' holds a {found} value")]
    WrongType { key: String, found: &'static str },
    /// A stored record could not be decoded.
    #[error("corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// What admission policies do when the store cannot be reached.
///
/// The circuit breaker ignores this and always degrades to its local fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Permit the operation and log the outage.
    #[default]
    Open,
    /// Reject the operation.
    Closed,
}

/// Outcome of [`CounterStore::increment_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedIncrement {
    /// Whether the delta was applied.
    pub applied: bool,
    /// Counter value after the call (unchanged when not applied).
    pub value: i64,
}

/// Parameters for a token-bucket take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub cost: f64,
    pub ttl: Duration,
}

/// Bucket state after a take.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub allowed: bool,
    /// Tokens left after the take (or after the refill, when denied).
    pub tokens: f64,
}

/// Sliding-window log state after recording (or refusing) an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLog {
    pub allowed: bool,
    /// Events inside the trailing window, including this one when allowed.
    pub count: u64,
    /// Timestamp of the oldest event still inside the window.
    pub oldest_millis: Option<u64>,
}

/// Atomically mutable key/value store shared by every process instance.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Add `delta` to the counter at `key`, creating it at zero. `ttl` applies only on creation.
    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>)
        -> Result<i64, StoreError>;

    /// Add `delta` only if the result stays `<= limit`; otherwise leave the counter unchanged.
    /// When applied, `ttl` (if given) resets the key's expiry to `now + ttl`.
    async fn increment_bounded(
        &self,
        key: &str,
        delta: i64,
        limit: i64,
        ttl: Option<Duration>,
    ) -> Result<BoundedIncrement, StoreError>;

    /// Subtract `delta`, flooring at zero.
    async fn decrement(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Current counter value; zero when absent or expired.
    async fn counter(&self, key: &str) -> Result<i64, StoreError>;

    /// Refill the bucket at `key` for the time elapsed up to `now_millis`, then take `spec.cost`
    /// tokens if available. Missing buckets start full.
    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        now_millis: u64,
    ) -> Result<BucketState, StoreError>;

    /// Evict events older than `window`, then record `now_millis` iff fewer than `limit` remain.
    async fn record_event(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowLog, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Write `value` only if the current value equals `expected` (`None` = key absent).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn CounterStore>;

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Bucket { tokens: f64, updated_at: u64 },
    Log(VecDeque<u64>),
    Text(String),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Counter(_) => "counter",
            Value::Bucket { .. } => "bucket",
            Value::Log(_) => "log",
            Value::Text(_) => "text",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

/// In-process [`CounterStore`] backed by a mutex-guarded map.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Evaluate TTLs against `clock` (share a [`crate::ManualClock`] with the policies in tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(clock),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.data
            .lock()
            .map(|map| map.values().filter(|e| !is_expired(e, now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<(MutexGuard<'_, HashMap<String, Entry>>, u64), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".into()));
        }
        let guard =
            self.data.lock().map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        Ok((guard, self.clock.now_millis()))
    }
}

fn is_expired(entry: &Entry, now: u64) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn expiry(now: u64, ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|t| now.saturating_add(duration_millis(t)))
}

/// Drop `key` if it has expired and return the live entry, if any.
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str, now: u64) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| is_expired(e, now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn counter_of(key: &str, entry: Option<&Entry>) -> Result<i64, StoreError> {
    match entry.map(|e| &e.value) {
        None => Ok(0),
        Some(Value::Counter(n)) => Ok(*n),
        Some(other) => Err(StoreError::WrongType { key: key.to_string(), found: other.kind() }),
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let (mut map, now) = self.lock()?;
        let current = counter_of(key, live(&mut map, key, now).as_deref())?;
        let next = current.saturating_add(delta);
        match map.get_mut(key) {
            Some(entry) => entry.value = Value::Counter(next),
            None => {
                map.insert(
                    key.to_string(),
                    Entry { value: Value::Counter(next), expires_at: expiry(now, ttl) },
                );
            }
        }
        Ok(next)
    }

    async fn increment_bounded(
        &self,
        key: &str,
        delta: i64,
        limit: i64,
        ttl: Option<Duration>,
    ) -> Result<BoundedIncrement, StoreError> {
        let (mut map, now) = self.lock()?;
        let current = counter_of(key, live(&mut map, key, now).as_deref())?;
        let next = current.saturating_add(delta);
        if next > limit {
            return Ok(BoundedIncrement { applied: false, value: current });
        }
        let expires_at = match (map.get(key), ttl) {
            (Some(entry), None) => entry.expires_at,
            _ => expiry(now, ttl),
        };
        map.insert(key.to_string(), Entry { value: Value::Counter(next), expires_at });
        Ok(BoundedIncrement { applied: true, value: next })
    }

    async fn decrement(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let (mut map, now) = self.lock()?;
        let Some(entry) = live(&mut map, key, now) else {
            return Ok(0);
        };
        let current = counter_of(key, Some(&*entry))?;
        let next = current.saturating_sub(delta).max(0);
        entry.value = Value::Counter(next);
        Ok(next)
    }

    async fn counter(&self, key: &str) -> Result<i64, StoreError> {
        let (mut map, now) = self.lock()?;
        let value = counter_of(key, live(&mut map, key, now).as_deref())?;
        Ok(value)
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        now_millis: u64,
    ) -> Result<BucketState, StoreError> {
        let (mut map, now) = self.lock()?;
        let (tokens, updated_at) = match live(&mut map, key, now).map(|e| &e.value) {
            None => (spec.capacity, now_millis),
            Some(Value::Bucket { tokens, updated_at }) => (*tokens, *updated_at),
            Some(other) => {
                return Err(StoreError::WrongType { key: key.to_string(), found: other.kind() })
            }
        };

        // A caller with a lagging clock never rewinds the bucket.
        let elapsed_secs = now_millis.saturating_sub(updated_at) as f64 / 1_000.0;
        let refilled = (tokens + elapsed_secs * spec.refill_per_sec).min(spec.capacity).max(0.0);
        let stamp = now_millis.max(updated_at);

        let (allowed, remaining) =
            if refilled >= spec.cost { (true, refilled - spec.cost) } else { (false, refilled) };

        map.insert(
            key.to_string(),
            Entry {
                value: Value::Bucket { tokens: remaining, updated_at: stamp },
                expires_at: expiry(now, Some(spec.ttl)),
            },
        );
        Ok(BucketState { allowed, tokens: remaining })
    }

    async fn record_event(
        &self,
        key: &str,
        now_millis: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowLog, StoreError> {
        let (mut map, now) = self.lock()?;
        let cutoff = now_millis.saturating_sub(duration_millis(window));
        live(&mut map, key, now);
        let entry = map
            .entry(key.to_string())
            .or_insert(Entry { value: Value::Log(VecDeque::new()), expires_at: None });
        let log = match &mut entry.value {
            Value::Log(log) => log,
            other => {
                return Err(StoreError::WrongType { key: key.to_string(), found: other.kind() })
            }
        };

        while log.front().is_some_and(|&t| t <= cutoff) {
            log.pop_front();
        }
        let allowed = (log.len() as u64) < limit;
        if allowed {
            log.push_back(now_millis);
        }
        let result =
            WindowLog { allowed, count: log.len() as u64, oldest_millis: log.front().copied() };
        entry.expires_at = expiry(now, Some(window));
        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (mut map, now) = self.lock()?;
        match live(&mut map, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(Value::Counter(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(StoreError::WrongType { key: key.to_string(), found: other.kind() }),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (mut map, now) = self.lock()?;
        map.insert(key.to_string(), Entry { value: Value::Text(value), expires_at: expiry(now, ttl) });
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let (mut map, now) = self.lock()?;
        let matches = match (live(&mut map, key, now).map(|e| &e.value), expected) {
            (None, None) => true,
            (Some(Value::Text(current)), Some(expected)) => current == expected,
            (Some(Value::Text(_)), None) | (None, Some(_)) => false,
            (Some(other), _) => {
                return Err(StoreError::WrongType { key: key.to_string(), found: other.kind() })
            }
        };
        if matches {
            map.insert(
                key.to_string(),
                Entry { value: Value::Text(value), expires_at: expiry(now, ttl) },
            );
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let (mut map, _) = self.lock()?;
        map.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::at_secs(1_000);
        (InMemoryCounterStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn increment_sets_ttl_only_on_create() {
        let (store, clock) = store();
        let ttl = Some(Duration::from_secs(10));

        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 1);
        clock.advance(Duration::from_secs(6));
        // Second increment must not push the expiry out.
        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 2);
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.counter("k").await.unwrap(), 0);
        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bounded_increment_never_partially_applies() {
        let (store, _) = store();

        let first = store.increment_bounded("q", 3, 5, None).await.unwrap();
        assert_eq!(first, BoundedIncrement { applied: true, value: 3 });

        let second = store.increment_bounded("q", 3, 5, None).await.unwrap();
        assert_eq!(second, BoundedIncrement { applied: false, value: 3 });

        let third = store.increment_bounded("q", 2, 5, None).await.unwrap();
        assert_eq!(third, BoundedIncrement { applied: true, value: 5 });
    }

    #[tokio::test]
    async fn bounded_increment_refreshes_ttl_when_applied() {
        let (store, clock) = store();
        let ttl = Some(Duration::from_secs(10));

        store.increment_bounded("lease", 1, 2, ttl).await.unwrap();
        clock.advance(Duration::from_secs(6));
        store.increment_bounded("lease", 1, 2, ttl).await.unwrap();
        clock.advance(Duration::from_secs(6));
        assert_eq!(store.counter("lease").await.unwrap(), 2);

        // A rejected increment leaves the expiry alone.
        assert!(!store.increment_bounded("lease", 1, 2, ttl).await.unwrap().applied);
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.counter("lease").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decrement_floors_at_zero() {
        let (store, _) = store();
        store.increment("p", 1, None).await.unwrap();
        assert_eq!(store.decrement("p", 5).await.unwrap(), 0);
        assert_eq!(store.decrement("missing", 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bucket_refill_is_capped_at_capacity() {
        let (store, clock) = store();
        let spec = BucketSpec { capacity: 2.0, refill_per_sec: 1.0, cost: 1.0, ttl: Duration::from_secs(60) };

        let now = clock.now_millis();
        assert!(store.take_tokens("b", spec, now).await.unwrap().allowed);
        assert!(store.take_tokens("b", spec, now).await.unwrap().allowed);
        assert!(!store.take_tokens("b", spec, now).await.unwrap().allowed);

        clock.advance(Duration::from_secs(30));
        let after_idle = store.take_tokens("b", spec, clock.now_millis()).await.unwrap();
        assert!(after_idle.allowed);
        assert!((after_idle.tokens - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn window_log_evicts_old_events() {
        let (store, clock) = store();
        let window = Duration::from_secs(10);

        for _ in 0..2 {
            assert!(store.record_event("w", clock.now_millis(), window, 2).await.unwrap().allowed);
        }
        let denied = store.record_event("w", clock.now_millis(), window, 2).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 2);

        clock.advance(Duration::from_secs(10));
        let allowed = store.record_event("w", clock.now_millis(), window, 2).await.unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.count, 1);
    }

    #[tokio::test]
    async fn compare_and_set_detects_races() {
        let (store, _) = store();
        assert!(store.compare_and_set("c", None, "a".into(), None).await.unwrap());
        assert!(!store.compare_and_set("c", None, "b".into(), None).await.unwrap());
        assert!(!store.compare_and_set("c", Some("x"), "b".into(), None).await.unwrap());
        assert!(store.compare_and_set("c", Some("a"), "b".into(), None).await.unwrap());
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let (store, _) = store();
        store.set("t", "text".into(), None).await.unwrap();
        let err = store.increment("t", 1, None).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { found: "text", .. }));
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let (store, _) = store();
        store.set_available(false);
        assert!(matches!(store.counter("k").await, Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.counter("k").await.unwrap(), 0);
    }
}
