//! Long-period usage caps per client tier.
//!
//! A client's usage for the current period lives at `quota:{clientId}:{periodKey}`, where the
//! period key is the UTC date (`2024-03-07`) for daily quotas, the UTC month (`2024-03`) for
//! monthly quotas, and `every-{secs}s-{index}` for custom periods. The key expires when the
//! period ends, so usage rolls over to zero exactly at the boundary.
//!
//! Consumption is a single bounded increment: `used` grows by `cost` only if the result stays
//! within the limit, so a rejected check never partially consumes the quota.
//!
//! Per-client tier assignments and custom limits are stored as JSON at `quota-override:{clientId}`
//! so every process sees administrative changes. The tier table itself is a [`DynamicConfig`].

use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, SystemClock};
use crate::error::{Rejection, RejectionReason};
use crate::store::{FailureMode, SharedStore, StoreError};
use crate::ResilienceError;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Service tier a client is billed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Premium,
    Enterprise,
    /// Never limited; usage is not recorded.
    Unlimited,
    /// Limit comes from a per-client override set with [`QuotaManager::set_custom_quota`].
    Custom,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
            Tier::Unlimited => "unlimited",
            Tier::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Accounting period of a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    /// Resets at UTC midnight.
    Daily,
    /// Resets at 00:00 UTC on the first of each month.
    Monthly,
    /// Fixed-length periods aligned to the Unix epoch.
    Custom { seconds: u64 },
}

impl QuotaPeriod {
    pub fn custom(length: Duration) -> Self {
        QuotaPeriod::Custom { seconds: length.as_secs().max(1) }
    }

    /// The period containing `now`.
    pub fn window_at(&self, now: DateTime<Utc>) -> PeriodWindow {
        match *self {
            QuotaPeriod::Daily => {
                let day = now.date_naive();
                let next = day.succ_opt().unwrap_or(day);
                PeriodWindow {
                    key: day.format("%Y-%m-%d").to_string(),
                    start: midnight(day),
                    reset_at: midnight(next),
                }
            }
            QuotaPeriod::Monthly => {
                let (year, month) = (now.year(), now.month());
                let (next_year, next_month) =
                    if month == 12 { (year + 1, 1) } else { (year, month + 1) };
                let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(now.date_naive());
                let next = NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap_or(first);
                PeriodWindow {
                    key: first.format("%Y-%m").to_string(),
                    start: midnight(first),
                    reset_at: midnight(next),
                }
            }
            QuotaPeriod::Custom { seconds } => {
                let length = i64::try_from(seconds.max(1)).unwrap_or(i64::MAX);
                let index = now.timestamp().div_euclid(length);
                let at = |secs: i64| Utc.timestamp_opt(secs, 0).single().unwrap_or(now);
                PeriodWindow {
                    key: format!("every-{length}s-{index}"),
                    start: at(index.saturating_mul(length)),
                    reset_at: at(index.saturating_add(1).saturating_mul(length)),
                }
            }
        }
    }
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN))
}

/// Boundaries of one accounting period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodWindow {
    /// Period component of the store key.
    pub key: String,
    pub start: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
}

/// `limit` units per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub limit: u64,
    pub period: QuotaPeriod,
}

impl QuotaLimit {
    pub const fn daily(limit: u64) -> Self {
        Self { limit, period: QuotaPeriod::Daily }
    }

    pub const fn monthly(limit: u64) -> Self {
        Self { limit, period: QuotaPeriod::Monthly }
    }
}

/// Limits per tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierTable(HashMap<Tier, QuotaLimit>);

impl Default for TierTable {
    fn default() -> Self {
        Self(HashMap::from([
            (Tier::Free, QuotaLimit::daily(1_000)),
            (Tier::Basic, QuotaLimit::daily(10_000)),
            (Tier::Premium, QuotaLimit::daily(100_000)),
            (Tier::Enterprise, QuotaLimit::monthly(5_000_000)),
        ]))
    }
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> Option<QuotaLimit> {
        self.0.get(&tier).copied()
    }

    pub fn with(mut self, tier: Tier, limit: QuotaLimit) -> Self {
        self.0.insert(tier, limit);
        self
    }
}

/// Per-client assignment stored at `quota-override:{clientId}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientQuota {
    tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    custom: Option<QuotaLimit>,
}

/// Result of a quota check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub tier: Tier,
    pub period: QuotaPeriod,
    /// The store was unreachable and the decision came from the failure mode.
    pub degraded: bool,
}

impl QuotaDecision {
    /// Time left until the period rolls over, measured from `now`.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn rejection(&self, now: DateTime<Utc>) -> Rejection {
        Rejection::new(RejectionReason::QuotaExceeded, self.used, self.limit, self.remaining)
            .with_retry_after(self.retry_after(now))
    }
}

/// Tracks per-client usage against tiered limits.
#[derive(Debug, Clone)]
pub struct QuotaManager {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    tiers: DynamicConfig<TierTable>,
    default_tier: Tier,
    failure_mode: FailureMode,
}

impl QuotaManager {
    /// Manager with the default tier table; clients without an override are on [`Tier::Free`].
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            tiers: DynamicConfig::default(),
            default_tier: Tier::Free,
            failure_mode: FailureMode::Open,
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

    /// Share a live-updatable tier table.
    pub fn with_tiers(mut self, tiers: DynamicConfig<TierTable>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_default_tier(mut self, tier: Tier) -> Self {
        self.default_tier = tier;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Handle to the tier table; updates apply to the next check.
    pub fn tiers(&self) -> &DynamicConfig<TierTable> {
        &self.tiers
    }

    fn now(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }

    fn usage_key(client_id: &str, window: &PeriodWindow) -> String {
        format!("quota:{client_id}:{}", window.key)
    }

    fn override_key(client_id: &str) -> String {
        format!("quota-override:{client_id}")
    }

    async fn assignment(&self, client_id: &str) -> Result<ClientQuota, StoreError> {
        let key = Self::override_key(client_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(ClientQuota { tier: self.default_tier, custom: None });
        };
        match serde_json::from_str::<ClientQuota>(&raw) {
            Ok(assignment) => Ok(assignment),
            Err(err) => {
                tracing::warn!(client_id, error = %err, "ignoring unreadable quota override");
                Ok(ClientQuota { tier: self.default_tier, custom: None })
            }
        }
    }

    /// Limit in force for an assignment: the custom limit, then the tier's, then the default tier's.
    fn resolve(&self, assignment: ClientQuota) -> (Tier, QuotaLimit) {
        if let Some(custom) = assignment.custom {
            return (Tier::Custom, custom);
        }
        let table = self.tiers.get();
        match table.get(assignment.tier).or_else(|| table.get(self.default_tier)) {
            Some(limit) => (assignment.tier, limit),
            None => {
                tracing::warn!(tier = %assignment.tier, "no quota configured for tier; using free tier default");
                (assignment.tier, QuotaLimit::daily(1_000))
            }
        }
    }

    fn unlimited(&self, now: DateTime<Utc>) -> QuotaDecision {
        QuotaDecision {
            allowed: true,
            used: 0,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: QuotaPeriod::Daily.window_at(now).reset_at,
            tier: Tier::Unlimited,
            period: QuotaPeriod::Daily,
            degraded: false,
        }
    }

    fn degraded(&self, client_id: &str, err: &StoreError, now: DateTime<Utc>) -> QuotaDecision {
        tracing::warn!(client_id, error = %err, mode = ?self.failure_mode, "quota store unavailable");
        let allowed = self.failure_mode == FailureMode::Open;
        QuotaDecision {
            allowed,
            used: 0,
            limit: 0,
            remaining: 0,
            reset_at: QuotaPeriod::Daily.window_at(now).reset_at,
            tier: self.default_tier,
            period: QuotaPeriod::Daily,
            degraded: true,
        }
    }

    /// Consume `cost` units of `client_id`'s quota if that keeps usage within the limit.
    pub async fn check(&self, client_id: &str, cost: u64) -> QuotaDecision {
        let now = self.now();
        match self.consume(client_id, cost, now).await {
            Ok(decision) => decision,
            Err(err) => self.degraded(client_id, &err, now),
        }
    }

    async fn consume(
        &self,
        client_id: &str,
        cost: u64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        let assignment = self.assignment(client_id).await?;
        if assignment.tier == Tier::Unlimited {
            return Ok(self.unlimited(now));
        }
        let (tier, quota) = self.resolve(assignment);
        let window = quota.period.window_at(now);
        let ttl = (window.reset_at - now).to_std().unwrap_or(Duration::ZERO).max(Duration::from_secs(1));

        let outcome = self
            .store
            .increment_bounded(
                &Self::usage_key(client_id, &window),
                i64::try_from(cost).unwrap_or(i64::MAX),
                i64::try_from(quota.limit).unwrap_or(i64::MAX),
                Some(ttl),
            )
            .await?;
        let used = u64::try_from(outcome.value).unwrap_or(0);
        if !outcome.applied {
            tracing::debug!(client_id, tier = %tier, used, limit = quota.limit, cost, "quota exceeded");
        }

        Ok(QuotaDecision {
            allowed: outcome.applied,
            used,
            limit: quota.limit,
            remaining: quota.limit.saturating_sub(used),
            reset_at: window.reset_at,
            tier,
            period: quota.period,
            degraded: false,
        })
    }

    /// [`QuotaManager::check`], turning a denial into `ResilienceError::QuotaExceeded`.
    pub async fn enforce<E>(
        &self,
        client_id: &str,
        cost: u64,
    ) -> Result<QuotaDecision, ResilienceError<E>> {
        let decision = self.check(client_id, cost).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(ResilienceError::QuotaExceeded(decision.rejection(self.now())))
        }
    }

    /// Current usage without consuming anything.
    pub async fn usage(&self, client_id: &str) -> Result<QuotaDecision, StoreError> {
        let now = self.now();
        let assignment = self.assignment(client_id).await?;
        if assignment.tier == Tier::Unlimited {
            return Ok(self.unlimited(now));
        }
        let (tier, quota) = self.resolve(assignment);
        let window = quota.period.window_at(now);
        let used = self.store.counter(&Self::usage_key(client_id, &window)).await?;
        let used = u64::try_from(used).unwrap_or(0);
        Ok(QuotaDecision {
            allowed: used < quota.limit,
            used,
            limit: quota.limit,
            remaining: quota.limit.saturating_sub(used),
            reset_at: window.reset_at,
            tier,
            period: quota.period,
            degraded: false,
        })
    }

    /// Move `client_id` onto `tier`, dropping any custom limit.
    pub async fn set_tier(&self, client_id: &str, tier: Tier) -> Result<(), StoreError> {
        self.write_assignment(client_id, ClientQuota { tier, custom: None }).await?;
        tracing::info!(client_id, tier = %tier, "quota tier assigned");
        Ok(())
    }

    /// Give `client_id` its own limit and period.
    pub async fn set_custom_quota(
        &self,
        client_id: &str,
        limit: u64,
        period: QuotaPeriod,
    ) -> Result<(), StoreError> {
        let custom = QuotaLimit { limit, period };
        self.write_assignment(client_id, ClientQuota { tier: Tier::Custom, custom: Some(custom) })
            .await?;
        tracing::info!(client_id, limit, ?period, "custom quota assigned");
        Ok(())
    }

    /// Tier currently assigned to `client_id`.
    pub async fn tier(&self, client_id: &str) -> Result<Tier, StoreError> {
        let assignment = self.assignment(client_id).await?;
        Ok(if assignment.custom.is_some() { Tier::Custom } else { assignment.tier })
    }

    /// Zero `client_id`'s usage for the current period.
    pub async fn reset(&self, client_id: &str) -> Result<(), StoreError> {
        let now = self.now();
        let (_, quota) = self.resolve(self.assignment(client_id).await?);
        let window = quota.period.window_at(now);
        self.store.delete(&Self::usage_key(client_id, &window)).await?;
        tracing::info!(client_id, period = %window.key, "quota usage reset");
        Ok(())
    }

    async fn write_assignment(&self, client_id: &str, assignment: ClientQuota) -> Result<(), StoreError> {
        let key = Self::override_key(client_id);
        let raw = serde_json::to_string(&assignment)
            .map_err(|e| StoreError::Corrupt { key: key.clone(), reason: e.to_string() })?;
        self.store.set(&key, raw, None).await
    }
}
