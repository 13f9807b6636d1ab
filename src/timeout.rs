//! Per-attempt timeout policy

use crate::ResilienceError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Rejected timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("timeout duration must be non-zero and finite (got {0:?})")]
pub struct InvalidTimeout(pub Duration);

/// Bounds a single attempt; exceeding the bound yields `ResilienceError::Timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Zero and `Duration::MAX` are rejected.
    pub fn new(duration: Duration) -> Result<Self, InvalidTimeout> {
        if duration.is_zero() || duration == Duration::MAX {
            return Err(InvalidTimeout(duration));
        }
        Ok(Self { duration })
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `operation`, dropping it if it does not finish within the bound.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                tracing::debug!(?elapsed, timeout = ?self.duration, "attempt timed out");
                Err(ResilienceError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}
