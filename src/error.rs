//! Error types for resilience policies
//!
//! [`ResilienceError`] is one tagged enumeration for everything a policy can produce. Admission
//! outcomes (`RateLimited`, `QuotaExceeded`, `Backpressure`, `CircuitOpen`,
//! `IdempotencyConflict`) are decided before the wrapped operation runs and are never retried.
//! Operation outcomes (`Inner`, `Timeout`, `RetryExhausted`) come from running it.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why an operation was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    RateLimitExceeded,
    QuotaExceeded,
    BackpressureRejected,
    CircuitOpen,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionReason::RateLimitExceeded => "rate limit exceeded",
            RejectionReason::QuotaExceeded => "quota exceeded",
            RejectionReason::BackpressureRejected => "backpressure rejected",
            RejectionReason::CircuitOpen => "circuit open",
        };
        f.write_str(s)
    }
}

/// Structured detail attached to every admission rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectionReason,
    /// When the caller may reasonably try again, if known.
    pub retry_after: Option<Duration>,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
}

impl Rejection {
    pub fn new(reason: RejectionReason, current: u64, limit: u64, remaining: u64) -> Self {
        Self { reason, retry_after: None, current, limit, remaining }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Wire form handed to the transport layer.
    pub fn decision(&self) -> AdmissionDecision {
        AdmissionDecision {
            allowed: false,
            reason: self.reason,
            retry_after_seconds: self.retry_after.map(ceil_secs),
            current: self.current,
            limit: self.limit,
            remaining: self.remaining,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} of {} used", self.reason, self.current, self.limit)?;
        if let Some(after) = self.retry_after {
            write!(f, ", retry after {:?}", after)?;
        }
        write!(f, ")")
    }
}

/// `{allowed:false, reason, retryAfterSeconds, current, limit, remaining}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: RejectionReason,
    pub retry_after_seconds: Option<u64>,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
}

fn ceil_secs(d: Duration) -> u64 {
    u64::try_from(d.as_millis().div_ceil(1_000)).unwrap_or(u64::MAX)
}

/// Classifies operation failures for `RetryPolicyBuilder::retryable_kinds`.
///
/// Timeouts raised by a per-attempt bound use the kind `"timeout"`.
pub trait FailureKind {
    fn kind(&self) -> &str;
}

/// Kind reported for per-attempt timeouts.
pub const TIMEOUT_KIND: &str = "timeout";

/// Unified error type for all resilience policies
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The rate limiter rejected the operation
    RateLimited(Rejection),
    /// The client's quota for the current period is used up
    QuotaExceeded(Rejection),
    /// No permit became available within the acquire timeout
    Backpressure(Rejection),
    /// The circuit breaker is open; the operation was not invoked
    CircuitOpen { name: String, failure_count: u64, threshold: u64, retry_after: Duration },
    /// An idempotency key was reused for a different request
    IdempotencyConflict { key: String },
    /// A single attempt exceeded its time bound
    Timeout { elapsed: Duration, timeout: Duration },
    /// All retry attempts were exhausted
    RetryExhausted { attempts: usize, last_failure: Box<ResilienceError<E>> },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited(r) | Self::QuotaExceeded(r) | Self::Backpressure(r) => {
                write!(f, "{}", r)
            }
            Self::CircuitOpen { name, failure_count, retry_after, .. } => {
                write!(
                    f,
                    "circuit breaker '{}' open ({} failures, retry after {:?})",
                    name, failure_count, retry_after
                )
            }
            Self::IdempotencyConflict { key } => {
                write!(f, "idempotency key '{}' was already used for a different request", key)
            }
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::RetryExhausted { attempts, last_failure } => {
                write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last_failure)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last_failure, .. } => Some(last_failure.as_ref()),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Wrap the final failure of a retry loop.
    pub fn retry_exhausted(attempts: usize, last_failure: ResilienceError<E>) -> Self {
        ResilienceError::RetryExhausted { attempts, last_failure: Box::new(last_failure) }
    }

    /// Admission outcome produced before the operation ran; never retried.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_)
                | Self::QuotaExceeded(_)
                | Self::Backpressure(_)
                | Self::CircuitOpen { .. }
                | Self::IdempotencyConflict { .. }
        )
    }

    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Backpressure(_))
    }

    pub fn is_idempotency_conflict(&self) -> bool {
        matches!(self, Self::IdempotencyConflict { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The failure that ended a retry loop, if this is `RetryExhausted`.
    pub fn last_failure(&self) -> Option<&ResilienceError<E>> {
        match self {
            Self::RetryExhausted { last_failure, .. } => Some(last_failure),
            _ => None,
        }
    }

    /// Access timeout details if this is a timeout error.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Structured rejection for rate, quota and backpressure outcomes.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::RateLimited(r) | Self::QuotaExceeded(r) | Self::Backpressure(r) => Some(r),
            _ => None,
        }
    }

    /// Structured decision for any admission rejection the transport layer can report.
    pub fn decision(&self) -> Option<AdmissionDecision> {
        match self {
            Self::CircuitOpen { failure_count, threshold, retry_after, .. } => Some(
                Rejection::new(RejectionReason::CircuitOpen, *failure_count, *threshold, 0)
                    .with_retry_after(*retry_after)
                    .decision(),
            ),
            other => other.rejection().map(Rejection::decision),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for DummyError {}

    fn rate_limited() -> ResilienceError<DummyError> {
        ResilienceError::RateLimited(
            Rejection::new(RejectionReason::RateLimitExceeded, 4, 3, 0)
                .with_retry_after(Duration::from_millis(56_500)),
        )
    }

    #[test]
    fn timeout_error_display() {
        let err: ResilienceError<io::Error> = ResilienceError::Timeout {
            elapsed: Duration::from_millis(5100),
            timeout: Duration::from_secs(5),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5.1"));
    }

    #[test]
    fn circuit_open_error_display() {
        let err: ResilienceError<io::Error> = ResilienceError::CircuitOpen {
            name: "payments".into(),
            failure_count: 10,
            threshold: 5,
            retry_after: Duration::from_secs(30),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("circuit breaker 'payments'"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn retry_exhausted_wraps_last_failure_as_source() {
        let err = ResilienceError::retry_exhausted(3, ResilienceError::Inner(DummyError("boom")));
        let msg = format!("{}", err);
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("boom"));

        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "boom");
        assert_eq!(err.last_failure().and_then(|e| e.as_inner()), Some(&DummyError("boom")));
    }

    #[test]
    fn rejection_decision_rounds_retry_after_up() {
        let decision = rate_limited().decision().unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, RejectionReason::RateLimitExceeded);
        assert_eq!(decision.retry_after_seconds, Some(57));
        assert_eq!((decision.current, decision.limit, decision.remaining), (4, 3, 0));
    }

    #[test]
    fn decision_serializes_with_camel_case_keys() {
        let json = serde_json::to_value(rate_limited().decision().unwrap()).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["reason"], "rate_limit_exceeded");
        assert_eq!(json["retryAfterSeconds"], 57);
        assert_eq!(json["limit"], 3);
    }

    #[test]
    fn circuit_open_has_a_decision() {
        let err: ResilienceError<DummyError> = ResilienceError::CircuitOpen {
            name: "db".into(),
            failure_count: 5,
            threshold: 5,
            retry_after: Duration::from_secs(12),
        };
        let decision = err.decision().unwrap();
        assert_eq!(decision.reason, RejectionReason::CircuitOpen);
        assert_eq!(decision.retry_after_seconds, Some(12));
    }

    #[test]
    fn policy_rejections_are_distinguished_from_failures() {
        assert!(rate_limited().is_policy_rejection());
        assert!(ResilienceError::<DummyError>::IdempotencyConflict { key: "k".into() }
            .is_policy_rejection());
        assert!(!ResilienceError::Inner(DummyError("x")).is_policy_rejection());
        assert!(!ResilienceError::<DummyError>::Timeout {
            elapsed: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        }
        .is_policy_rejection());
        assert!(ResilienceError::Inner(DummyError("x")).decision().is_none());
    }

    #[test]
    fn source_is_none_for_rejections() {
        assert!(rate_limited().source().is_none());
    }

    #[test]
    fn into_inner_extracts_error() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err = ResilienceError::Inner(io_err);
        assert!(err.is_inner());
        let extracted = err.into_inner().unwrap();
        assert_eq!(extracted.to_string(), "test");
    }
}
