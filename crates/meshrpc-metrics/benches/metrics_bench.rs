// Criterion benchmarks for meshrpc-metrics
//
// Run benchmarks with:
//   cargo bench -p meshrpc-metrics
//
// For detailed output with plots:
//   cargo bench -p meshrpc-metrics -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meshrpc_metrics::{CallOutcome, MetricsConfig, MetricsRegistry, MetricsSink, NoopSink};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn bench_record_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_call");

    let registry = MetricsRegistry::new();
    group.bench_function("registry", |b| {
        b.iter(|| {
            registry.record_call(
                black_box("greeting/hello"),
                black_box(Instant::now()),
                black_box(CallOutcome::Success),
            );
        });
    });

    let noop = NoopSink;
    group.bench_function("noop", |b| {
        b.iter(|| {
            noop.record_call(
                black_box("greeting/hello"),
                black_box(Instant::now()),
                black_box(CallOutcome::Success),
            );
        });
    });

    group.finish();
}

fn bench_record_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_route");

    let registry = MetricsRegistry::new();
    let endpoints = ["node-a", "node-b", "node-c"];
    group.bench_function("three_endpoints", |b| {
        b.iter(|| {
            for endpoint in &endpoints {
                registry.record_route(black_box("greeting/hello"), black_box(endpoint));
            }
        });
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for qualifier_count in [1, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(qualifier_count),
            qualifier_count,
            |b, &count| {
                let registry = MetricsRegistry::new();
                for i in 0..1000u64 {
                    let outcome = if i % 10 == 0 {
                        CallOutcome::Failure
                    } else {
                        CallOutcome::Success
                    };
                    registry.record_latency(&format!("svc/m{}", i as usize % count), i, outcome);
                }
                b.iter(|| registry.snapshot());
            },
        );
    }

    group.finish();
}

fn bench_concurrent_recording(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_recording");

    for threads in [2, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            let registry = Arc::new(MetricsRegistry::with_config(MetricsConfig::default()));
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let registry = registry.clone();
                        thread::spawn(move || {
                            let qualifier = format!("svc/m{}", t);
                            for i in 0..100 {
                                registry.record_latency(&qualifier, i, CallOutcome::Success);
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    let _ = handle.join();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_record_call,
    bench_record_route,
    bench_snapshot,
    bench_concurrent_recording
);
criterion_main!(benches);
