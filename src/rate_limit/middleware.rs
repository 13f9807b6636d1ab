//! Tower [`Layer`] and [`Service`] that apply a [`RateLimiter`] to each request.

use crate::rate_limit::{RateLimitRule, RateLimiter};
use crate::ResilienceError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that enforces a [`RateLimitRule`] using a [`RateLimiter`].
///
/// `key` maps each request to the identifier it is counted under (user id, API key, address).
pub struct RateLimitLayer<K> {
    limiter: RateLimiter,
    rule: RateLimitRule,
    key: Arc<K>,
}

impl<K> Clone for RateLimitLayer<K> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), rule: self.rule, key: self.key.clone() }
    }
}

impl<K> RateLimitLayer<K> {
    /// Create a new rate limit layer.
    pub fn new(limiter: RateLimiter, rule: RateLimitRule, key: K) -> Self {
        Self { limiter, rule, key: Arc::new(key) }
    }
}

impl<K> fmt::Debug for RateLimitLayer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("rule", &self.rule).finish_non_exhaustive()
    }
}

impl<S, K> Layer<S> for RateLimitLayer<K> {
    type Service = RateLimitService<S, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            rule: self.rule,
            key: self.key.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, K> {
    inner: S,
    limiter: RateLimiter,
    rule: RateLimitRule,
    key: Arc<K>,
}

impl<S: Clone, K> Clone for RateLimitService<S, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            rule: self.rule,
            key: self.key.clone(),
        }
    }
}

impl<S: fmt::Debug, K> fmt::Debug for RateLimitService<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("rule", &self.rule)
            .finish_non_exhaustive()
    }
}

impl<S, K, Req> Service<Req> for RateLimitService<S, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    K: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let rule = self.rule;
        let identifier = (self.key)(&req);
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            limiter.enforce::<S::Error>(&identifier, &rule).await?;
            inner.call(req).await.map_err(ResilienceError::Inner)
        })
    }
}
