//! Backoff strategies for retry policies.
//!
//! One [`Backoff`] type covers every variant, selected by the [`Strategy`] configuration enum:
//! fixed, linear, exponential, exponential with ±20% jitter, and Fibonacci. Attempt semantics:
//! `delay(n)` is the wait *after* failed attempt `n`, i.e. before attempt `n + 1`; attempt `0`
//! represents "no failure yet" and always yields zero, so the first call is never delayed.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use tollgate::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use crate::jitter::{Jitter, DEFAULT_JITTER_RATIO};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is not valid for fixed backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Backoff variant selected by configuration (`"strategy"` in a route policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
    ExponentialJitter,
    Fibonacci,
}

/// Trait implemented by all backoff strategies.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: usize) -> Duration;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConstantBackoff {
    delay: Duration,
}

impl BackoffStrategy for ConstantBackoff {
    fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.delay
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LinearBackoff {
    base: Duration,
    max: Option<Duration>,
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let attempt_u32 = attempt.min(u32::MAX as usize) as u32;
        let linear = self.base.checked_mul(attempt_u32).unwrap_or(MAX_BACKOFF);
        cap(linear, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExponentialBackoff {
    base: Duration,
    max: Option<Duration>,
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        cap(exp_delay, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FibonacciBackoff {
    base: Duration,
    max: Option<Duration>,
}

impl BackoffStrategy for FibonacciBackoff {
    fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ceiling = self.max.unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF).as_nanos();
        let base = self.base.as_nanos();
        // fib(1) = fib(2) = 1
        let (mut prev, mut current) = (0u128, 1u128);
        for _ in 1..attempt {
            if base.saturating_mul(current) >= ceiling {
                break;
            }
            let next = prev.saturating_add(current);
            prev = current;
            current = next;
        }
        let nanos = base.saturating_mul(current).min(ceiling);
        Duration::from_nanos(nanos as u64)
    }
}

fn cap(delay: Duration, max: Option<Duration>) -> Duration {
    max.map(|m| delay.min(m)).unwrap_or(delay).min(MAX_BACKOFF)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    Constant(ConstantBackoff),
    Linear(LinearBackoff),
    Exponential(ExponentialBackoff),
    Fibonacci(FibonacciBackoff),
}

impl BackoffStrategy for BackoffKind {
    fn delay(&self, attempt: usize) -> Duration {
        match self {
            BackoffKind::Constant(c) => c.delay(attempt),
            BackoffKind::Linear(l) => l.delay(attempt),
            BackoffKind::Exponential(e) => e.delay(attempt),
            BackoffKind::Fibonacci(f) => f.delay(attempt),
        }
    }
}

/// Backoff strategy: a deterministic schedule plus optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    kind: BackoffKind,
    jitter: Jitter,
}

impl Backoff {
    /// `base` after every failed attempt.
    pub fn constant(delay: Duration) -> Self {
        Self::from_kind(BackoffKind::Constant(ConstantBackoff { delay }))
    }

    /// `base * attempt`.
    pub fn linear(base: Duration) -> Self {
        Self::from_kind(BackoffKind::Linear(LinearBackoff { base, max: None }))
    }

    /// `base * 2^(attempt - 1)`.
    pub fn exponential(base: Duration) -> Self {
        Self::from_kind(BackoffKind::Exponential(ExponentialBackoff { base, max: None }))
    }

    /// Exponential schedule scaled by a uniform factor in `[0.8, 1.2]`.
    pub fn exponential_jitter(base: Duration) -> Self {
        Self::exponential(base).with_jitter(Jitter::Proportional(DEFAULT_JITTER_RATIO))
    }

    /// `base * fib(attempt)` with `fib(1) = fib(2) = 1`.
    pub fn fibonacci(base: Duration) -> Self {
        Self::from_kind(BackoffKind::Fibonacci(FibonacciBackoff { base, max: None }))
    }

    /// Build the backoff named by `strategy`. `max` is ignored for [`Strategy::Fixed`].
    pub fn from_strategy(
        strategy: Strategy,
        base: Duration,
        max: Option<Duration>,
    ) -> Result<Self, BackoffError> {
        let backoff = match strategy {
            Strategy::Fixed => return Ok(Self::constant(base)),
            Strategy::Linear => Self::linear(base),
            Strategy::Exponential => Self::exponential(base),
            Strategy::ExponentialJitter => Self::exponential_jitter(base),
            Strategy::Fibonacci => Self::fibonacci(base),
        };
        match max {
            Some(max) => backoff.with_max(max),
            None => Ok(backoff),
        }
    }

    fn from_kind(kind: BackoffKind) -> Self {
        Self { kind, jitter: Jitter::None }
    }

    /// Set a maximum delay (applied before jitter).
    /// Returns an error for constant backoff, a zero `max`, or `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        let (base, existing) = match &mut self.kind {
            BackoffKind::Exponential(ExponentialBackoff { max: existing, base })
            | BackoffKind::Linear(LinearBackoff { max: existing, base })
            | BackoffKind::Fibonacci(FibonacciBackoff { max: existing, base }) => (*base, existing),
            BackoffKind::Constant(_) => return Err(BackoffError::ConstantDoesNotSupportMax),
        };
        if max < base {
            return Err(BackoffError::MaxLessThanBase { base, max });
        }
        *existing = Some(max);
        Ok(self)
    }

    /// Randomize every computed delay with `jitter`.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// The jitter applied on top of the schedule.
    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// The schedule's delay after failed attempt `attempt`, before jitter.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        self.kind.delay(attempt)
    }

    /// Delay after failed attempt `attempt` (0 = no failure yet, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.kind.delay(attempt))
    }

    /// Like [`Backoff::delay`] but drawing jitter from `rng`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: usize, rng: &mut R) -> Duration {
        self.jitter.apply_with_rng(self.kind.delay(attempt), rng)
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, attempt: usize) -> Duration {
        Backoff::delay(self, attempt)
    }
}
