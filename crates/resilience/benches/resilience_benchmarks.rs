use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use genq_resilience::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig, Retryable,
};

#[derive(Debug)]
struct Never;

impl core::fmt::Display for Never {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("never")
    }
}

impl Retryable for Never {
    fn is_retryable(&self) -> bool {
        true
    }
}

fn bench_rate_limiter_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter_acquire");
    group.throughput(Throughput::Elements(1));

    // Day-window history is the expensive part of a grant; measure with the
    // deque partially filled.
    for prefilled in [0u32, 1_000, 10_000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(prefilled),
            prefilled,
            |b, &prefilled| {
                let limiter = RateLimiter::new(RateLimiterConfig {
                    max_per_minute: u32::MAX,
                    max_per_hour: u32::MAX,
                    max_per_day: u32::MAX,
                    max_concurrent: u32::MAX,
                })
                .unwrap();
                for _ in 0..prefilled {
                    limiter.try_acquire().unwrap().release();
                }

                b.iter(|| {
                    let permit = limiter.try_acquire();
                    black_box(&permit);
                });
            },
        );
    }

    group.finish();
}

fn bench_rate_limiter_denial(c: &mut Criterion) {
    let limiter = RateLimiter::new(RateLimiterConfig::default().with_max_per_minute(1)).unwrap();
    let _held = limiter.try_acquire().unwrap();

    c.bench_function("rate_limiter_denial", |b| {
        b.iter(|| black_box(limiter.try_acquire().is_err()));
    });
}

fn bench_breaker_call(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("circuit_breaker_call");
    group.sample_size(1000);

    group.bench_function("closed_success", |b| {
        let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default()).unwrap();
        b.iter(|| {
            rt.block_on(async {
                let out: Result<u32, BreakerError<Never>> =
                    breaker.call(|| async { Ok(black_box(7)) }).await;
                black_box(out)
            })
        });
    });

    group.bench_function("open_rejection", |b| {
        let breaker = CircuitBreaker::new(
            "bench",
            CircuitBreakerConfig::default().with_failure_threshold(1),
        )
        .unwrap();
        let _ = rt.block_on(breaker.call(|| async { Err::<u32, _>(Never) }));

        b.iter(|| {
            rt.block_on(async {
                let out: Result<u32, BreakerError<Never>> =
                    breaker.call(|| async { Ok(black_box(7)) }).await;
                black_box(out.is_err())
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_rate_limiter_acquire,
    bench_rate_limiter_denial,
    bench_breaker_call
);
criterion_main!(benches);
