//! Registry for managing named circuit breakers.
//!
//! Resolves `circuitBreakerName` from route policies to a shared [`CircuitBreaker`] and gives
//! administrators reset/inspection by name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};
use crate::clock::{Clock, SystemClock};
use crate::store::SharedStore;
use tracing::warn;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerRegistryError {
    /// The requested circuit breaker name was not found.
    #[error("circuit breaker '{name}' not found")]
    NotFound { name: String },
}

/// Name → breaker map. Clones share the same map.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    store: SharedStore,
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    /// Breakers created on demand use `defaults`.
    pub fn new(store: SharedStore, defaults: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            store,
            defaults,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a breaker with its own configuration, replacing any existing one.
    ///
    /// The persisted state is keyed by name, so a replacement keeps observing the same circuit.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let breaker = self.build(name, config);
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(name) {
            warn!(name = %name, "circuit breaker replaced; last registration wins");
        }
        map.insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Existing breaker for `name`, or a new one with the default configuration.
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string()).or_insert_with(|| self.build(name, self.defaults)).clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name).cloned()
    }

    /// Reset a breaker by name, erroring if it was never registered here.
    pub async fn reset(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        let breaker = self
            .get(name)
            .ok_or_else(|| CircuitBreakerRegistryError::NotFound { name: name.to_string() })?;
        breaker.reset().await;
        Ok(())
    }

    /// Stats for every known breaker, sorted by name.
    pub async fn snapshot(&self) -> Vec<CircuitStats> {
        let breakers: Vec<CircuitBreaker> = {
            let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };
        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn build(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(name, self.store.clone(), config).with_shared_clock(self.clock.clone())
    }
}
