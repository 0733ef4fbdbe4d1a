//! Benchmarks for the reservation path and retry scheduling.
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use deferred_core::backend::{Backend, InMemoryBackend, ReserveCriteria};
use deferred_core::jobs::{BackoffStrategy, JobError, JobRecord, RetryPolicy};
use std::time::Duration;

fn criteria(read_ahead: usize) -> ReserveCriteria {
    ReserveCriteria {
        worker: "bench".to_string(),
        queues: Vec::new(),
        min_priority: None,
        max_priority: None,
        max_run_time: Duration::from_secs(1200),
        read_ahead,
        now: Utc::now(),
    }
}

fn bench_reserve(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_reserve");
    let rt = tokio::runtime::Runtime::new().unwrap();
    group.throughput(Throughput::Elements(1));

    for size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let backend = InMemoryBackend::new();
                    let now = Utc::now();
                    rt.block_on(async {
                        for i in 0..size {
                            let mut record = JobRecord::new("FastJob", serde_json::json!({}), now, now);
                            record.priority = (i % 10) as i32;
                            backend.insert(&record).await.unwrap();
                        }
                    });
                    backend
                },
                |backend| {
                    rt.block_on(async {
                        black_box(backend.reserve(&criteria(5)).await.unwrap());
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_read_ahead(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_reserve_read_ahead");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for read_ahead in [1usize, 5, 25] {
        group.bench_with_input(BenchmarkId::from_parameter(read_ahead), &read_ahead, |b, &read_ahead| {
            let backend = InMemoryBackend::new();
            let now = Utc::now();
            rt.block_on(async {
                for _ in 0..1_000 {
                    let record = JobRecord::new("FastJob", serde_json::json!({}), now, now);
                    backend.insert(&record).await.unwrap();
                }
            });
            b.iter(|| rt.block_on(async { black_box(backend.candidates(&criteria(read_ahead)).await.unwrap()) }));
        });
    }
    group.finish();
}

fn bench_retry_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_decision");
    let now = Utc::now();
    let mut record = JobRecord::new("FastJob", serde_json::json!({}), now, now);
    record.attempts = 7;
    let error = JobError::retryable("connection reset by peer");

    let strategies = [
        ("polynomial", BackoffStrategy::default()),
        ("fixed", BackoffStrategy::fixed(30)),
        ("exponential", BackoffStrategy::exponential(1, 3600)),
    ];
    for (name, strategy) in strategies {
        let policy = RetryPolicy::default().with_backoff(strategy);
        group.bench_function(name, |b| b.iter(|| black_box(policy.decide(&record, None, &error, now))));
    }
    group.finish();
}

criterion_group!(benches, bench_reserve, bench_read_ahead, bench_retry_decision);
criterion_main!(benches);
