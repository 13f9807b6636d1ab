//! Backpressure admission: bounded concurrency permits per resource.
//!
//! Each resource has a permit counter at `permits:{resource}` in the shared store, so the limit
//! holds across every process. Acquiring is one bounded increment; releasing is one decrement.
//! Every acquire renews the counter's lease, so permits leaked by a crashed process come back
//! once a full lease passes without any acquire. Holds must stay shorter than the lease.
//! A [`Permit`] guard gives the permit back when released explicitly or, if the holder is
//! dropped early (an error path, a cancelled task), from a spawned release task.
//!
//! Waiters in this process are woken when a local permit is released; permits released by other
//! processes are noticed on the next poll.

use crate::adaptive::DynamicConfig;
use crate::error::{Rejection, RejectionReason};
use crate::store::{FailureMode, SharedStore, StoreError};
use crate::ResilienceError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How often a blocked `acquire` re-checks the store.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lease on a resource's permit counter, renewed by every acquire.
pub const DEFAULT_PERMIT_LEASE: Duration = Duration::from_secs(300);

// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Permit limits per resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermitLimits {
    /// Limit for resources without an entry.
    pub default_limit: u64,
    #[serde(default)]
    pub resources: HashMap<String, u64>,
}

impl Default for PermitLimits {
    fn default() -> Self {
        Self { default_limit: 100, resources: HashMap::new() }
    }
}

impl PermitLimits {
    pub fn with(mut self, resource: impl Into<String>, limit: u64) -> Self {
        self.resources.insert(resource.into(), limit);
        self
    }

    pub fn limit_for(&self, resource: &str) -> u64 {
        self.resources.get(resource).copied().unwrap_or(self.default_limit)
    }
}

/// Permit usage of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub resource: String,
    pub current: u64,
    pub limit: u64,
    pub available: u64,
    pub utilization_percent: f64,
}

/// Aggregate usage across resources.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemLoad {
    /// Permits in use over permits available, across all resources.
    pub utilization_percent: f64,
    pub resources: Vec<Usage>,
}

fn percent(current: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    (current as f64 / limit as f64) * 100.0
}

/// Counting permit pools per resource, shared through the store.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    store: SharedStore,
    limits: DynamicConfig<PermitLimits>,
    poll_interval: Duration,
    lease_ttl: Duration,
    failure_mode: FailureMode,
    notify: Arc<Notify>,
    seen: Arc<RwLock<BTreeSet<String>>>,
}

impl AdmissionController {
    pub fn new(store: SharedStore, limits: PermitLimits) -> Self {
        Self::with_limits(store, DynamicConfig::new(limits))
    }

    /// Controller reading its limits from a live-updatable handle.
    pub fn with_limits(store: SharedStore, limits: DynamicConfig<PermitLimits>) -> Self {
        Self {
            store,
            limits,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_ttl: DEFAULT_PERMIT_LEASE,
            failure_mode: FailureMode::Open,
            notify: Arc::new(Notify::new()),
            seen: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_lease_ttl(mut self, lease: Duration) -> Self {
        self.lease_ttl = lease.max(Duration::from_secs(1));
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn limits(&self) -> &DynamicConfig<PermitLimits> {
        &self.limits
    }

    fn key(resource: &str) -> String {
        format!("permits:{resource}")
    }

    fn remember(&self, resource: &str) {
        let known = self.seen.read().unwrap_or_else(PoisonError::into_inner).contains(resource);
        if !known {
            self.seen.write().unwrap_or_else(PoisonError::into_inner).insert(resource.to_string());
        }
    }

    /// Take a permit for `resource`, waiting up to `timeout` for one to free up.
    ///
    /// A zero timeout never waits. Returns `None` when no permit became available.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Option<Permit> {
        self.remember(resource);
        let key = Self::key(resource);
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);

        loop {
            // Register before checking so a release in between is not missed.
            let released = self.notify.notified();
            let limit = i64::try_from(self.limits.get().limit_for(resource)).unwrap_or(i64::MAX);

            match self.store.increment_bounded(&key, 1, limit, Some(self.lease_ttl)).await {
                Ok(outcome) if outcome.applied => {
                    return Some(Permit::new(self.clone(), resource, true));
                }
                Ok(outcome) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!(resource, in_use = outcome.value, limit, "no permit available");
                        return None;
                    }
                    let wait = (deadline - now).min(self.poll_interval);
                    let _ = tokio::time::timeout(wait, released).await;
                }
                Err(err) => {
                    tracing::warn!(resource, error = %err, mode = ?self.failure_mode, "permit store unavailable");
                    return match self.failure_mode {
                        FailureMode::Open => Some(Permit::new(self.clone(), resource, false)),
                        FailureMode::Closed => None,
                    };
                }
            }
        }
    }

    /// [`AdmissionController::acquire`], turning a timeout into `ResilienceError::Backpressure`.
    pub async fn admit<E>(&self, resource: &str, timeout: Duration) -> Result<Permit, ResilienceError<E>> {
        if let Some(permit) = self.acquire(resource, timeout).await {
            return Ok(permit);
        }
        let limit = self.limits.get().limit_for(resource);
        let current = self.store.counter(&Self::key(resource)).await.map_or(limit, |n| u64::try_from(n).unwrap_or(0));
        let rejection = Rejection::new(
            RejectionReason::BackpressureRejected,
            current,
            limit,
            limit.saturating_sub(current),
        )
        .with_retry_after(self.poll_interval);
        Err(ResilienceError::Backpressure(rejection))
    }

    /// Return one permit for `resource`. Call once per successful acquire; prefer
    /// [`Permit::release`], which does this for you.
    pub async fn release(&self, resource: &str) {
        if let Err(err) = self.store.decrement(&Self::key(resource), 1).await {
            tracing::warn!(resource, error = %err, "failed to release permit");
        }
        self.notify.notify_waiters();
    }

    /// Run `operation` holding a permit for `resource`. The permit is released on every exit path.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        resource: &str,
        timeout: Duration,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.admit(resource, timeout).await?;
        let result = operation().await;
        permit.release().await;
        result
    }

    pub async fn get_usage(&self, resource: &str) -> Result<Usage, StoreError> {
        let limit = self.limits.get().limit_for(resource);
        let current = u64::try_from(self.store.counter(&Self::key(resource)).await?).unwrap_or(0);
        Ok(Usage {
            resource: resource.to_string(),
            current,
            limit,
            available: limit.saturating_sub(current),
            utilization_percent: percent(current, limit),
        })
    }

    /// Usage of every configured resource and every resource acquired through this controller.
    pub async fn get_system_load(&self) -> SystemLoad {
        let mut names: BTreeSet<String> =
            self.seen.read().unwrap_or_else(PoisonError::into_inner).clone();
        names.extend(self.limits.get().resources.keys().cloned());

        let mut resources = Vec::with_capacity(names.len());
        for name in names {
            match self.get_usage(&name).await {
                Ok(usage) => resources.push(usage),
                Err(err) => tracing::warn!(resource = %name, error = %err, "skipping resource in load report"),
            }
        }
        let current: u64 = resources.iter().map(|u| u.current).sum();
        let limit: u64 = resources.iter().map(|u| u.limit).sum();
        let utilization_percent = if resources.is_empty() { 0.0 } else { percent(current, limit) };
        SystemLoad { utilization_percent, resources }
    }
}

/// A held permit. Release it with [`Permit::release`]; dropping it releases in the background.
#[must_use = "dropping a permit releases it immediately"]
#[derive(Debug)]
pub struct Permit {
    controller: AdmissionController,
    resource: String,
    // false once released, or when the permit was granted without touching the store
    armed: bool,
}

impl Permit {
    fn new(controller: AdmissionController, resource: &str, armed: bool) -> Self {
        Self { controller, resource: resource.to_string(), armed }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub async fn release(mut self) {
        if std::mem::take(&mut self.armed) {
            self.controller.release(&self.resource).await;
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let controller = self.controller.clone();
        let resource = std::mem::take(&mut self.resource);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { controller.release(&resource).await });
            }
            Err(_) => {
                tracing::error!(resource = %resource, "permit dropped outside a runtime; it will not be released");
            }
        }
    }
}
