//! Convenient re-exports for common tollgate types.
pub use crate::{
    backoff::{Backoff, BackoffError, BackoffStrategy, Strategy, MAX_BACKOFF},
    backpressure::{AdmissionController, Permit, PermitLimits, Usage},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    config::{ConfigError, CoreConfig, IdempotencyKeySource, RoutePolicy},
    error::{AdmissionDecision, FailureKind, Rejection, RejectionReason},
    idempotency::{CachedResponse, IdempotencyConflict, IdempotencyStore, RequestFingerprint},
    jitter::Jitter,
    pipeline::{ClientIdentity, Executed, Inbound, Pipeline, PipelineBuilder},
    quota::{QuotaDecision, QuotaLimit, QuotaManager, QuotaPeriod, Tier},
    rate_limit::{Algorithm, RateDecision, RateLimitLayer, RateLimitRule, RateLimiter},
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    store::{CounterStore, FailureMode, InMemoryCounterStore, SharedStore},
    throttle::{ThrottleDecision, Throttler},
    timeout::TimeoutPolicy,
    ResilienceError,
};
