//! Jitter strategies to prevent synchronized retry storms
//!
//! When to use which strategy:
//! - `None`: deterministic delays for tests or tightly controlled workflows.
//! - `Proportional`: scale the delay by a uniform factor in `[1 - ratio, 1 + ratio]`. The
//!   exponential-with-jitter backoff uses a ratio of `0.2` (±20%).
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor while adding randomness.
//!
//! RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Ratio used by [`crate::Strategy::ExponentialJitter`].
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Errors returned when constructing a jitter strategy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JitterError {
    #[error("jitter ratio must be within [0, 1] (got {0})")]
    InvalidRatio(f64),
}

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Multiply by a uniform factor in `[1 - ratio, 1 + ratio]`
    Proportional(f64),
    /// Full jitter: random between 0 and delay
    Full,
    /// Equal jitter: random between delay/2 and delay
    Equal,
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::None
    }
}

impl Jitter {
    /// ±`ratio` proportional jitter; `ratio` must lie in `[0, 1]`.
    pub fn proportional(ratio: f64) -> Result<Self, JitterError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(JitterError::InvalidRatio(ratio));
        }
        Ok(Jitter::Proportional(ratio))
    }

    /// Create a full jitter strategy
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Create an equal jitter strategy
    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional(ratio) => {
                if delay.is_zero() || ratio == 0.0 {
                    return delay;
                }
                let factor = rng.random_range((1.0 - ratio)..=(1.0 + ratio));
                delay.mul_f64(factor)
            }
            Jitter::Full => {
                let millis = as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
