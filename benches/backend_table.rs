//! Benchmarks for proxyd components.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use proxyd::backend::BackendTable;
use proxyd::metrics::MetricsCollector;
use proxyd::proxy::SpliceOutcome;
use proxyd::util::ConnectionId;
use std::sync::Arc;
use std::time::Duration;

fn create_table(num_endpoints: usize) -> Arc<BackendTable> {
    let table = Arc::new(BackendTable::new());
    for i in 0..num_endpoints {
        table.add(&format!("10.0.{}.{}", i / 256, i % 256));
    }
    table
}

fn benchmark_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_release");

    for size in [3, 16, 256] {
        let table = create_table(size);

        // Uneven load so selection has to scan.
        for _ in 0..size * 2 {
            table.acquire();
        }

        group.bench_with_input(BenchmarkId::from_parameter(size), &table, |b, table| {
            b.iter(|| {
                let address = table.acquire();
                if let Some(ref address) = address {
                    table.release(black_box(address));
                }
                black_box(address);
            })
        });
    }

    group.finish();
}

fn benchmark_lease(c: &mut Criterion) {
    let table = create_table(3);

    c.bench_function("lease_drop", |b| {
        b.iter(|| {
            black_box(table.lease());
        })
    });
}

fn benchmark_membership_churn(c: &mut Criterion) {
    let table = create_table(16);

    c.bench_function("add_delete", |b| {
        b.iter(|| {
            table.add(black_box("10.1.0.1"));
            table.delete(black_box("10.1.0.1"));
        })
    });
}

fn benchmark_metrics(c: &mut Criterion) {
    let collector = MetricsCollector::new();

    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record_splice", |b| {
        b.iter(|| {
            collector.record_splice(
                black_box(4096),
                black_box(65536),
                black_box(Duration::from_millis(250)),
            );
        })
    });

    group.bench_function("set_active_connections", |b| {
        b.iter(|| {
            collector.set_active_connections(black_box("10.0.0.1"), black_box(Some(1)));
            collector.set_active_connections(black_box("10.0.0.1"), black_box(Some(0)));
        })
    });

    group.bench_function("record_outcome", |b| {
        b.iter(|| {
            collector.record_outcome(black_box(SpliceOutcome::Completed));
        })
    });

    group.finish();
}

fn benchmark_connection_id(c: &mut Criterion) {
    c.bench_function("connection_id", |b| {
        b.iter(|| {
            black_box(ConnectionId::next());
        })
    });
}

criterion_group!(
    benches,
    benchmark_acquire_release,
    benchmark_lease,
    benchmark_membership_churn,
    benchmark_metrics,
    benchmark_connection_id,
);

criterion_main!(benches);
