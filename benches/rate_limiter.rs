use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tollgate::{
    Algorithm, CircuitBreaker, CircuitBreakerConfig, InMemoryCounterStore, RateLimitLayer,
    RateLimitRule, RateLimiter, ResilienceError,
};
use tower::{Service, ServiceBuilder, ServiceExt};

// Large enough that the limiter admits every iteration.
const GENEROUS: u64 = u64::MAX / 2;

fn rate_limiter_check(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()));

    for (name, algorithm) in [
        ("fixed_window", Algorithm::FixedWindow),
        ("sliding_window", Algorithm::SlidingWindow),
        ("token_bucket", Algorithm::TokenBucket),
    ] {
        let rule = RateLimitRule::new(GENEROUS, Duration::from_secs(60)).with_algorithm(algorithm);
        c.bench_function(&format!("rate_limiter_check_{name}"), |b| {
            b.to_async(&rt).iter(|| async {
                black_box(limiter.check(black_box("bench-client"), &rule).await);
            });
        });
    }
}

fn rate_limit_layer(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()));
    let layer = RateLimitLayer::new(
        limiter,
        RateLimitRule::new(GENEROUS, Duration::from_secs(60)),
        |req: &&'static str| req.to_string(),
    );
    let svc = ServiceBuilder::new()
        .layer(layer)
        .service(tower::service_fn(|req: &'static str| async move { Ok::<_, std::io::Error>(req) }));

    c.bench_function("rate_limit_layer_admit", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let ready = local_svc.ready().await.unwrap();
            let _ = black_box(ready.call(black_box("request")).await);
        });
    });
}

fn circuit_breaker_open_fast_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = CircuitBreakerConfig::new(1, 1, Duration::from_secs(3_600)).unwrap();
    let breaker = CircuitBreaker::new("bench", Arc::new(InMemoryCounterStore::new()), config);
    rt.block_on(breaker.record_failure());

    c.bench_function("circuit_breaker_reject_open", |b| {
        b.to_async(&rt).iter(|| async {
            let result = breaker
                .call(|| async { Ok::<_, ResilienceError<std::io::Error>>(()) })
                .await;
            black_box(result.is_err());
        });
    });
}

criterion_group!(benches, rate_limiter_check, rate_limit_layer, circuit_breaker_open_fast_path);
criterion_main!(benches);
