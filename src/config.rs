//! Declarative configuration.
//!
//! [`CoreConfig`] carries component defaults plus a table of per-route [`RoutePolicy`] values,
//! resolved before any operation runs. It is plain serde data, usually loaded from JSON:
//!
//! ```json
//! {
//!   "failureMode": "open",
//!   "circuitBreaker": { "failureThreshold": 5, "successThreshold": 2, "openTimeout": 60 },
//!   "routes": {
//!     "create-order": {
//!       "limit": 100, "window": 60, "algorithm": "sliding_window",
//!       "maxAttempts": 3, "strategy": "exponential_jitter", "baseDelay": 200,
//!       "circuitBreakerName": "orders-db",
//!       "idempotencyKeySource": { "header": "Idempotency-Key" },
//!       "quotaCost": 1, "resource": "orders-db"
//!     }
//!   }
//! }
//! ```
//!
//! Units: `window`, `openTimeout`, `idempotencyTtl` and `leaseTtl` are seconds; `baseDelay`,
//! `maxDelay`, `permitTimeout`, `perAttemptTimeout` and `pollInterval` are milliseconds.

use crate::backoff::{Backoff, BackoffError, Strategy};
use crate::backpressure::PermitLimits;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::quota::TierTable;
use crate::rate_limit::{Algorithm, RateLimitRule};
use crate::store::FailureMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field: field.into(), reason: reason.into() }
    }
}

/// Where the transport finds a request's idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyKeySource {
    Header(String),
    Query(String),
}

impl Default for IdempotencyKeySource {
    fn default() -> Self {
        IdempotencyKeySource::Header("Idempotency-Key".to_string())
    }
}

/// Policy applied to one route. Every section is optional; an empty policy admits everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutePolicy {
    /// Requests per `window`; rate limiting is off unless both are set. `0` rejects every request.
    pub limit: Option<u64>,
    /// Seconds. Shared by the rate limiter and the throttler.
    pub window: Option<u64>,
    pub burst: Option<f64>,
    pub algorithm: Algorithm,
    /// Requests per window before the throttler starts delaying.
    pub threshold: Option<u64>,
    /// Retries are off unless set above 1.
    pub max_attempts: Option<usize>,
    pub strategy: Strategy,
    /// Milliseconds.
    pub base_delay: Option<u64>,
    /// Milliseconds.
    pub max_delay: Option<u64>,
    pub circuit_breaker_name: Option<String>,
    pub idempotency_key_source: Option<IdempotencyKeySource>,
    /// Seconds a stored response is replayable.
    pub idempotency_ttl: Option<u64>,
    /// Quota units consumed per request; quota is not checked when unset.
    pub quota_cost: Option<u64>,
    /// Permit pool the route draws from.
    pub resource: Option<String>,
    /// Milliseconds to wait for a permit (0 = fail immediately).
    pub permit_timeout: Option<u64>,
    /// Milliseconds each attempt may run.
    pub per_attempt_timeout: Option<u64>,
}

/// Default first retry delay when a route sets none.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

impl RoutePolicy {
    pub fn rate_rule(&self) -> Option<RateLimitRule> {
        let (limit, window) = (self.limit?, self.window?);
        let mut rule =
            RateLimitRule::new(limit, Duration::from_secs(window)).with_algorithm(self.algorithm);
        if let Some(burst) = self.burst {
            rule = rule.with_burst(burst);
        }
        Some(rule)
    }

    /// `(threshold, window)` when throttling is configured.
    pub fn throttle(&self) -> Option<(u64, Duration)> {
        Some((self.threshold?, Duration::from_secs(self.window?)))
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.unwrap_or(1).max(1)
    }

    pub fn backoff(&self) -> Result<Backoff, BackoffError> {
        let base = self.base_delay.map_or(DEFAULT_BASE_DELAY, Duration::from_millis);
        Backoff::from_strategy(self.strategy, base, self.max_delay.map(Duration::from_millis))
    }

    pub fn permit_timeout(&self) -> Duration {
        Duration::from_millis(self.permit_timeout.unwrap_or(0))
    }

    pub fn per_attempt_timeout(&self) -> Option<Duration> {
        self.per_attempt_timeout.map(Duration::from_millis)
    }

    pub fn idempotency_ttl(&self) -> Option<Duration> {
        self.idempotency_ttl.map(Duration::from_secs)
    }

    fn validate(&self, route: &str) -> Result<(), ConfigError> {
        let field = |name: &str| format!("routes.{route}.{name}");
        if self.window == Some(0) {
            return Err(ConfigError::invalid(field("window"), "must be at least 1 second"));
        }
        if self.limit.is_some() && self.window.is_none() {
            return Err(ConfigError::invalid(field("limit"), "requires `window`"));
        }
        if self.threshold.is_some() && self.window.is_none() {
            return Err(ConfigError::invalid(field("threshold"), "requires `window`"));
        }
        if self.threshold == Some(0) {
            return Err(ConfigError::invalid(field("threshold"), "must be greater than zero"));
        }
        if let Some(burst) = self.burst {
            if !burst.is_finite() || burst < 1.0 {
                return Err(ConfigError::invalid(field("burst"), "must be a finite number >= 1"));
            }
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::invalid(field("maxAttempts"), "must be at least 1"));
        }
        if self.per_attempt_timeout == Some(0) {
            return Err(ConfigError::invalid(field("perAttemptTimeout"), "must be greater than zero"));
        }
        self.backoff().map_err(|e| ConfigError::invalid(field("maxDelay"), e.to_string()))?;
        Ok(())
    }
}

/// Circuit breaker defaults for names without their own registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitDefaults {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    /// Seconds.
    pub open_timeout: u64,
    pub half_open_max_calls: Option<usize>,
}

impl Default for CircuitDefaults {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 2, open_timeout: 60, half_open_max_calls: None }
    }
}

impl CircuitDefaults {
    pub fn to_config(&self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        let config = CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            Duration::from_secs(self.open_timeout),
        )?;
        match self.half_open_max_calls {
            Some(limit) => config.with_half_open_limit(limit),
            None => Ok(config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThrottleDefaults {
    /// Milliseconds.
    pub base_delay: u64,
    /// Milliseconds.
    pub max_delay: u64,
}

impl Default for ThrottleDefaults {
    fn default() -> Self {
        Self { base_delay: 100, max_delay: 10_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermitDefaults {
    #[serde(flatten)]
    pub limits: PermitLimits,
    /// Milliseconds.
    pub poll_interval: u64,
    /// Seconds a resource's permit counter survives without any acquire.
    pub lease_ttl: u64,
}

impl Default for PermitDefaults {
    fn default() -> Self {
        Self {
            limits: PermitLimits::default(),
            poll_interval: 25,
            lease_ttl: crate::backpressure::DEFAULT_PERMIT_LEASE.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdempotencyDefaults {
    /// Seconds.
    pub ttl: u64,
    /// Response headers that may be replayed.
    pub safe_headers: Vec<String>,
}

impl Default for IdempotencyDefaults {
    fn default() -> Self {
        Self {
            ttl: crate::idempotency::DEFAULT_IDEMPOTENCY_TTL.as_secs(),
            safe_headers: crate::idempotency::DEFAULT_SAFE_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
        }
    }
}

/// Everything needed to assemble a [`crate::pipeline::Pipeline`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Admission behaviour while the shared store is unreachable.
    pub failure_mode: FailureMode,
    pub circuit_breaker: CircuitDefaults,
    pub throttle: ThrottleDefaults,
    pub permits: PermitDefaults,
    pub quota_tiers: TierTable,
    pub idempotency: IdempotencyDefaults,
    pub routes: HashMap<String, RoutePolicy>,
}

impl CoreConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json(&raw)
    }

    pub fn route(&self, name: &str) -> Option<&RoutePolicy> {
        self.routes.get(name)
    }

    pub fn with_route(mut self, name: impl Into<String>, policy: RoutePolicy) -> Self {
        self.routes.insert(name.into(), policy);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker
            .to_config()
            .map_err(|e| ConfigError::invalid("circuitBreaker", e.to_string()))?;
        if self.throttle.base_delay == 0 || self.throttle.max_delay < self.throttle.base_delay {
            return Err(ConfigError::invalid(
                "throttle",
                "`baseDelay` must be positive and no greater than `maxDelay`",
            ));
        }
        if self.permits.poll_interval == 0 {
            return Err(ConfigError::invalid("permits.pollInterval", "must be greater than zero"));
        }
        if self.permits.lease_ttl == 0 {
            return Err(ConfigError::invalid("permits.leaseTtl", "must be greater than zero"));
        }
        if self.idempotency.ttl == 0 {
            return Err(ConfigError::invalid("idempotency.ttl", "must be greater than zero"));
        }
        for (name, route) in &self.routes {
            route.validate(name)?;
        }
        Ok(())
    }
}
