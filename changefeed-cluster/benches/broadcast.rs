//! Fan-out benchmarks for the broadcaster
//!
//! Run with: cargo bench -p changefeed-cluster --bench broadcast

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;

use changefeed_cluster::{Broadcaster, SubscriberRegistry};
use changefeed_core::{ChangeEvent, Row};

fn sample_event() -> Arc<ChangeEvent> {
    let mut data = Row::new();
    data.insert("id".to_string(), 42.into());
    data.insert("balance".to_string(), 100.into());
    Arc::new(
        ChangeEvent::insert("accounts", data)
            .expect("valid event")
            .with_timestamp(chrono::Utc::now()),
    )
}

/// Benchmark: publish to N subscribers that keep up
fn bench_publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fanout");
    let event = sample_event();

    for subscribers in [1usize, 10, 100, 1000] {
        let registry = Arc::new(SubscriberRegistry::new(1024));
        let broadcaster = Broadcaster::new(registry.clone());
        let mut handles: Vec<_> = (0..subscribers).map(|_| registry.register()).collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    let report = broadcaster.publish(Arc::clone(&event));
                    for handle in &mut handles {
                        black_box(handle.try_recv());
                    }
                    black_box(report);
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: publish when every subscriber channel is full
fn bench_publish_all_full(c: &mut Criterion) {
    let registry = Arc::new(SubscriberRegistry::new(1));
    let broadcaster = Broadcaster::new(registry.clone());
    let _handles: Vec<_> = (0..100).map(|_| registry.register()).collect();
    let event = sample_event();
    broadcaster.publish(Arc::clone(&event));

    c.bench_function("publish_100_full_subscribers", |b| {
        b.iter(|| black_box(broadcaster.publish(Arc::clone(&event))));
    });
}

criterion_group!(benches, bench_publish_fanout, bench_publish_all_full);
criterion_main!(benches);
