//! Throughput benchmarks for Switchboard.
//!
//! These benchmarks measure the admission hot path and broker fan-out.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use switchboard_admission::{build_backend, Identity, LimiterKind, RuleConfig, RuleSet};
use switchboard_core::broker::room_group;
use switchboard_core::config::default_rules;
use switchboard_core::{Broker, InMemoryBroker};
use switchboard_protocol::OutboundFrame;
use tokio::runtime::Runtime;

const BACKENDS: [LimiterKind; 3] = [
    LimiterKind::SlidingWindow,
    LimiterKind::TokenBucket,
    LimiterKind::FixedWindow,
];

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// One hot key, as when a single client floods.
fn bench_limiter_hot_key(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("limiter_hot_key");

    for kind in BACKENDS {
        let backend = build_backend(kind);
        group.bench_function(BenchmarkId::from_parameter(backend.name()), |b| {
            b.to_async(&rt).iter(|| async {
                backend
                    .check(black_box("user:alice"), 100, Duration::from_secs(10), None)
                    .await
            });
        });
    }

    group.finish();
}

/// Many distinct keys, as under broad load.
fn bench_limiter_spread_keys(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("limiter_spread_keys");
    let keys: Vec<String> = (0..10_000).map(|i| format!("addr:10.0.{}.{}", i / 256, i % 256)).collect();

    for kind in BACKENDS {
        let backend = build_backend(kind);
        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_function(BenchmarkId::from_parameter(backend.name()), |b| {
            b.to_async(&rt).iter(|| async {
                for key in &keys {
                    let _ = backend
                        .check(key, 30, Duration::from_secs(60), None)
                        .await;
                }
            });
        });
    }

    group.finish();
}

/// Rule matching over the default rules plus a long tail.
fn bench_rule_resolve(c: &mut Criterion) {
    let mut configs = default_rules();
    configs.extend((0..50).map(|i| RuleConfig {
        name: format!("room-{}", i),
        pattern: format!("^message\\.send:room-{}$", i),
        required_group: None,
        limit: 10,
        window_secs: 1,
        burst: None,
        priority: 5,
        strategy: Default::default(),
        action: Default::default(),
    }));
    let rules = RuleSet::from_configs(&configs).unwrap();
    let identity = Identity::user("alice");

    let mut group = c.benchmark_group("rules");
    group.bench_function("resolve_default", |b| {
        b.iter(|| rules.resolve(black_box("message.send:general"), &identity, "10.0.0.1"))
    });
    group.bench_function("resolve_tail", |b| {
        b.iter(|| rules.resolve(black_box("message.send:room-49"), &identity, "10.0.0.1"))
    });
    group.finish();
}

/// Publish to a room group with N subscribers.
fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fanout");

    for size in [10usize, 100, 1000, 10000] {
        let broker = Arc::new(InMemoryBroker::with_capacity(16));
        let receivers: Vec<_> = rt.block_on(async {
            let mut receivers = Vec::with_capacity(size);
            for i in 0..size {
                receivers.push(
                    broker
                        .subscribe(&room_group("general"), &format!("conn_{}", i))
                        .await
                        .unwrap(),
                );
            }
            receivers
        });
        let event = Arc::new(OutboundFrame::UserJoined {
            room: "general".into(),
            identity: "alice".into(),
        });

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                broker
                    .publish(&room_group("general"), Arc::clone(black_box(&event)))
                    .await
            });
        });
        drop(receivers);
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_limiter_hot_key,
    bench_limiter_spread_keys,
    bench_rule_resolve,
    bench_fanout,
);
criterion_main!(benches);
