//! The per-operation admission sequence.
//!
//! [`Pipeline::run`] applies a route's [`RoutePolicy`] in a fixed order:
//!
//! 1. backpressure permit (`resource`)
//! 2. quota (`quotaCost`)
//! 3. rate limit (`limit` / `window`)
//! 4. throttle delay (`threshold`)
//! 5. idempotent replay (`idempotencyKeySource`)
//! 6. the operation, inside retry and circuit breaker (`maxAttempts`, `circuitBreakerName`)
//! 7. record the response for replay
//! 8. release the permit
//!
//! Admission rejections from steps 1 to 3 surface immediately and are never retried. The permit
//! is released on every exit path, including cancellation of the returned future.
//!
//! The transport describes each call as an [`Inbound`] and turns [`Executed`] or the
//! [`ResilienceError`] into its own response; status codes are not decided here.

use crate::backpressure::AdmissionController;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, CoreConfig, IdempotencyKeySource, RoutePolicy};
use crate::idempotency::{CachedResponse, IdempotencyStore, RequestFingerprint, REPLAY_HEADER};
use crate::quota::{QuotaDecision, QuotaManager};
use crate::rate_limit::{RateDecision, RateLimitRule, RateLimiter};
use crate::retry::{RetryPolicy, RetryStats, RetryStatsSnapshot};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::SharedStore;
use crate::throttle::{ThrottleDecision, Throttler};
use crate::timeout::TimeoutPolicy;
use crate::ResilienceError;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Who is calling. Resolves to the identifier every policy counts under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    pub remote_addr: Option<String>,
}

impl ClientIdentity {
    /// `user:{id}`, else `key:{apiKey}`, else `ip:{addr}`, else `anonymous`.
    pub fn resolve(&self) -> String {
        if let Some(user) = &self.user_id {
            format!("user:{user}")
        } else if let Some(key) = &self.api_key {
            format!("key:{key}")
        } else if let Some(addr) = &self.remote_addr {
            format!("ip:{addr}")
        } else {
            "anonymous".to_string()
        }
    }
}

/// Transport-neutral description of one inbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inbound {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub identity: ClientIdentity,
}

impl Inbound {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self { method: method.into(), path: path.into(), ..Self::default() }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// First header named `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    fn idempotency_key(&self, source: &IdempotencyKeySource) -> Option<&str> {
        let key = match source {
            IdempotencyKeySource::Header(name) => self.header(name),
            IdempotencyKeySource::Query(name) => self.query_param(name),
        };
        key.filter(|key| !key.is_empty())
    }

    fn fingerprint(&self) -> RequestFingerprint {
        let query: Vec<(&str, &str)> =
            self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        RequestFingerprint::compute(&self.method, &self.path, &query, &self.body)
    }
}

/// A completed call plus the policy decisions made along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub response: CachedResponse,
    /// The response came from the idempotency store; the operation did not run.
    pub replayed: bool,
    pub client_id: String,
    pub rate: Option<RateDecision>,
    pub quota: Option<QuotaDecision>,
    pub throttle: Option<ThrottleDecision>,
    /// Aggregate permit utilization after the call.
    pub system_load_percent: f64,
}

impl Executed {
    /// Headers a transport may attach: rate limit state, replay flag and system load.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .rate
            .iter()
            .flat_map(|rate| rate.headers())
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        if self.replayed {
            headers.push((REPLAY_HEADER.to_string(), "true".to_string()));
        }
        headers.push(("X-System-Load".to_string(), format!("{:.0}", self.system_load_percent)));
        headers
    }
}

type Resolver = Arc<dyn Fn(&Inbound) -> String + Send + Sync>;

struct RoutePlan<E> {
    policy: RoutePolicy,
    rate: Option<RateLimitRule>,
    retry: RetryPolicy<E>,
}

/// Admission and execution for every configured route.
pub struct Pipeline<E> {
    routes: Arc<HashMap<String, RoutePlan<E>>>,
    fallback: Arc<RoutePlan<E>>,
    limiter: RateLimiter,
    throttler: Throttler,
    quotas: QuotaManager,
    breakers: CircuitBreakerRegistry,
    idempotency: IdempotencyStore,
    permits: AdmissionController,
    resolver: Resolver,
    retry_stats: Arc<RetryStats>,
}

impl<E> Clone for Pipeline<E> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
            fallback: self.fallback.clone(),
            limiter: self.limiter.clone(),
            throttler: self.throttler.clone(),
            quotas: self.quotas.clone(),
            breakers: self.breakers.clone(),
            idempotency: self.idempotency.clone(),
            permits: self.permits.clone(),
            resolver: self.resolver.clone(),
            retry_stats: self.retry_stats.clone(),
        }
    }
}

impl<E> fmt::Debug for Pipeline<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<&String> = self.routes.keys().collect();
        routes.sort();
        f.debug_struct("Pipeline").field("routes", &routes).finish_non_exhaustive()
    }
}

impl<E> Pipeline<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder(store: SharedStore, config: CoreConfig) -> PipelineBuilder<E> {
        PipelineBuilder::new(store, config)
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn quotas(&self) -> &QuotaManager {
        &self.quotas
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    pub fn permits(&self) -> &AdmissionController {
        &self.permits
    }

    /// Retry counters across every route.
    pub fn retry_stats(&self) -> RetryStatsSnapshot {
        self.retry_stats.snapshot()
    }

    /// Run `operation` for `route` under that route's policy. Unknown routes get an empty policy.
    pub async fn run<Fut, Op>(
        &self,
        route: &str,
        inbound: &Inbound,
        operation: Op,
    ) -> Result<Executed, ResilienceError<E>>
    where
        Fut: Future<Output = Result<CachedResponse, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let plan = match self.routes.get(route) {
            Some(plan) => plan,
            None => {
                tracing::debug!(route, "no policy configured for route");
                &*self.fallback
            }
        };
        let client_id = (self.resolver)(inbound);

        let permit = match &plan.policy.resource {
            Some(resource) => {
                Some(self.permits.admit::<E>(resource, plan.policy.permit_timeout()).await?)
            }
            None => None,
        };

        let outcome = self.admitted(route, plan, inbound, &client_id, operation).await;

        if let Some(permit) = permit {
            permit.release().await;
        }
        let mut executed = outcome?;
        executed.system_load_percent = self.permits.get_system_load().await.utilization_percent;
        Ok(executed)
    }

    async fn admitted<Fut, Op>(
        &self,
        route: &str,
        plan: &RoutePlan<E>,
        inbound: &Inbound,
        client_id: &str,
        operation: Op,
    ) -> Result<Executed, ResilienceError<E>>
    where
        Fut: Future<Output = Result<CachedResponse, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let policy = &plan.policy;
        let scoped_id = format!("{route}:{client_id}");

        let quota = match policy.quota_cost {
            Some(cost) => Some(self.quotas.enforce::<E>(client_id, cost).await?),
            None => None,
        };

        let rate = match &plan.rate {
            Some(rule) => Some(self.limiter.enforce::<E>(&scoped_id, rule).await?),
            None => None,
        };

        let throttle = match policy.throttle() {
            Some((threshold, window)) => {
                Some(self.throttler.throttle(&scoped_id, threshold, window).await)
            }
            None => None,
        };

        let idempotency = policy
            .idempotency_key_source
            .as_ref()
            .and_then(|source| inbound.idempotency_key(source))
            .map(|key| (key, inbound.fingerprint()));

        let mut executed = Executed {
            response: CachedResponse::new(0, Vec::new()),
            replayed: false,
            client_id: client_id.to_string(),
            rate,
            quota,
            throttle,
            system_load_percent: 0.0,
        };

        if let Some((key, fingerprint)) = &idempotency {
            if let Some(replay) = self.idempotency.check(key, fingerprint).await? {
                executed.response = replay.response;
                executed.replayed = true;
                return Ok(executed);
            }
        }

        executed.response = plan.retry.execute(operation).await?;

        if let Some((key, fingerprint)) = &idempotency {
            let ttl = policy.idempotency_ttl().unwrap_or(self.idempotency.default_ttl());
            if let Err(conflict) = self
                .idempotency
                .store_with_ttl(key, fingerprint, executed.response.clone(), ttl)
                .await
            {
                tracing::warn!(route, error = %conflict, "response not recorded for replay");
            }
        }
        Ok(executed)
    }
}

/// Assembles a [`Pipeline`] from a [`CoreConfig`].
pub struct PipelineBuilder<E> {
    store: SharedStore,
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    resolver: Resolver,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> PipelineBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(store: SharedStore, config: CoreConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            resolver: Arc::new(|inbound: &Inbound| inbound.identity.resolve()),
            should_retry: Arc::new(|_| true),
        }
    }

    /// Clock shared by every component (and the store, if it takes one).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sleeper used for throttle delays and retry backoff.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Replace [`ClientIdentity::resolve`] as the source of client identifiers.
    pub fn client_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Inbound) -> String + Send + Sync + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Decide which operation errors are retried on every route (default: all).
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn build(self) -> Result<Pipeline<E>, ConfigError> {
        let config = self.config;
        config.validate()?;
        let store = self.store;
        let clock = self.clock;
        let failure_mode = config.failure_mode;

        let breaker_defaults = config
            .circuit_breaker
            .to_config()
            .map_err(|e| invalid("circuitBreaker", e))?;
        let breakers = CircuitBreakerRegistry::new(store.clone(), breaker_defaults)
            .with_shared_clock(clock.clone());

        let limiter = RateLimiter::new(store.clone())
            .with_shared_clock(clock.clone())
            .with_failure_mode(failure_mode);
        let throttler = Throttler::new(
            store.clone(),
            Duration::from_millis(config.throttle.base_delay),
            Duration::from_millis(config.throttle.max_delay),
        )
        .map_err(|e| invalid("throttle", e))?
        .with_shared_clock(clock.clone())
        .with_shared_sleeper(self.sleeper.clone());
        let quotas = QuotaManager::new(store.clone())
            .with_shared_clock(clock.clone())
            .with_tiers(crate::adaptive::DynamicConfig::new(config.quota_tiers.clone()))
            .with_failure_mode(failure_mode);
        let idempotency = IdempotencyStore::new(store.clone())
            .with_shared_clock(clock.clone())
            .with_default_ttl(Duration::from_secs(config.idempotency.ttl))
            .with_safe_headers(config.idempotency.safe_headers.iter().cloned());
        let permits = AdmissionController::new(store.clone(), config.permits.limits.clone())
            .with_poll_interval(Duration::from_millis(config.permits.poll_interval))
            .with_lease_ttl(Duration::from_secs(config.permits.lease_ttl))
            .with_failure_mode(failure_mode);

        let retry_stats = Arc::new(RetryStats::default());
        let plan = |name: &str, policy: RoutePolicy| -> Result<RoutePlan<E>, ConfigError> {
            let field = |f: &str| format!("routes.{name}.{f}");
            let predicate = self.should_retry.clone();
            let mut retry = RetryPolicy::builder()
                .name(name)
                .max_attempts(policy.attempts())
                .backoff(policy.backoff().map_err(|e| invalid(field("maxDelay"), e))?)
                .should_retry(move |e: &E| predicate(e))
                .with_shared_sleeper(self.sleeper.clone())
                .stats(retry_stats.clone());
            if let Some(name) = &policy.circuit_breaker_name {
                retry = retry.circuit_breaker(breakers.get_or_create(name));
            }
            if let Some(bound) = policy.per_attempt_timeout() {
                let timeout =
                    TimeoutPolicy::new(bound).map_err(|e| invalid(field("perAttemptTimeout"), e))?;
                retry = retry.attempt_timeout(timeout);
            }
            let retry = retry.build().map_err(|e| invalid(field("maxAttempts"), e))?;
            Ok(RoutePlan { rate: policy.rate_rule(), policy, retry })
        };

        let mut routes = HashMap::with_capacity(config.routes.len());
        for (name, policy) in &config.routes {
            routes.insert(name.clone(), plan(name, policy.clone())?);
        }
        let fallback = plan("default", RoutePolicy::default())?;

        Ok(Pipeline {
            routes: Arc::new(routes),
            fallback: Arc::new(fallback),
            limiter,
            throttler,
            quotas,
            breakers,
            idempotency,
            permits,
            resolver: self.resolver,
            retry_stats,
        })
    }
}

fn invalid(field: impl Into<String>, err: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: err.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_resolution_order() {
        let mut identity = ClientIdentity {
            user_id: Some("42".into()),
            api_key: Some("abc".into()),
            remote_addr: Some("10.0.0.1".into()),
        };
        assert_eq!(identity.resolve(), "user:42");
        identity.user_id = None;
        assert_eq!(identity.resolve(), "key:abc");
        identity.api_key = None;
        assert_eq!(identity.resolve(), "ip:10.0.0.1");
        identity.remote_addr = None;
        assert_eq!(identity.resolve(), "anonymous");
    }

    #[test]
    fn idempotency_key_lookup() {
        let inbound = Inbound::new("POST", "/orders")
            .with_header("idempotency-key", "abc")
            .with_query("token", "");
        let header = IdempotencyKeySource::Header("Idempotency-Key".into());
        assert_eq!(inbound.idempotency_key(&header), Some("abc"));
        assert_eq!(inbound.idempotency_key(&IdempotencyKeySource::Query("token".into())), None);
    }

    #[test]
    fn executed_headers_include_replay_and_load() {
        let executed = Executed {
            response: CachedResponse::new(200, "ok"),
            replayed: true,
            client_id: "anonymous".into(),
            rate: None,
            quota: None,
            throttle: None,
            system_load_percent: 37.6,
        };
        let headers = executed.headers();
        assert!(headers.contains(&(REPLAY_HEADER.to_string(), "true".to_string())));
        assert!(headers.contains(&("X-System-Load".to_string(), "38".to_string())));
    }
}
