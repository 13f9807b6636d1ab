#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Distributed admission control and resilience for async Rust services.
//!
//! Every policy keeps its state in a shared [`CounterStore`], so rate limits, quotas, circuit
//! state, permits and idempotency records agree across all instances of a horizontally scaled
//! deployment.
//!
//! ## Features
//!
//! - **Rate limiting**: fixed window, sliding window and token bucket, plus a Tower layer
//! - **Throttling**: progressive delays instead of rejections
//! - **Quotas**: daily/monthly usage caps per client tier
//! - **Circuit breakers**: store-backed state machine with a local fallback
//! - **Retries**: five backoff strategies, per-attempt timeouts, retry statistics
//! - **Idempotency**: replay-safe response cache with request fingerprints
//! - **Backpressure**: bounded permit pools per resource with scoped release
//! - **Pipeline**: the whole call sequence driven by declarative per-route configuration
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tollgate::{
//!     Backoff, InMemoryCounterStore, InstantSleeper, RateLimitRule, RateLimiter,
//!     ResilienceError, RetryPolicy,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryCounterStore::new());
//!
//! let limiter = RateLimiter::new(store);
//! let rule = RateLimitRule::new(3, Duration::from_secs(60));
//! let decision = limiter.check("user:42", &rule).await;
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 2);
//!
//! let retry = RetryPolicy::<std::io::Error>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_sleeper(InstantSleeper)
//!     .build()?;
//! let value = retry.execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(7) }).await?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod backpressure;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod jitter;
pub mod pipeline;
pub mod prelude;
pub mod quota;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;
pub mod store;
pub mod throttle;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::{Backoff, Strategy};
pub use backpressure::{AdmissionController, Permit, PermitLimits};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoreConfig, RoutePolicy};
pub use error::{AdmissionDecision, RejectionReason, ResilienceError};
pub use idempotency::{CachedResponse, IdempotencyStore, RequestFingerprint};
pub use jitter::Jitter;
pub use pipeline::{ClientIdentity, Executed, Inbound, Pipeline};
pub use quota::{QuotaManager, QuotaPeriod, Tier};
pub use rate_limit::{Algorithm, RateDecision, RateLimitLayer, RateLimitRule, RateLimiter};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{ClockSleeper, InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{CounterStore, FailureMode, InMemoryCounterStore, SharedStore, StoreError};
pub use throttle::Throttler;
pub use timeout::TimeoutPolicy;
