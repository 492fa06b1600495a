//! Performance benchmarks for subscription dispatch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam_channel::{bounded, unbounded};
use std::time::Duration;
use subflow::{ConnectionConfig, Loopback};

/// Publish then pull a batch through a sync subscription
fn bench_sync_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_round_trip");

    for batch in [1, 100, 1000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            let (conn, _server) =
                Loopback::connect(ConnectionConfig::default(), Default::default()).unwrap();
            let sub = conn.subscribe_sync("bench").unwrap();
            let payload = vec![0u8; 128];

            b.iter(|| {
                for _ in 0..batch {
                    conn.publish("bench", &payload).unwrap();
                }
                for _ in 0..batch {
                    black_box(sub.next_message(Duration::from_secs(1)).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Publish a batch and wait for an async handler to see all of it
fn bench_async_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_dispatch");

    for batch in [100, 1000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            let (conn, _server) =
                Loopback::connect(ConnectionConfig::default(), Default::default()).unwrap();
            let (tx, rx) = unbounded();
            let _sub = conn
                .subscribe("bench", move |msg| {
                    let _ = tx.send(msg.payload.len());
                })
                .unwrap();
            let payload = vec![0u8; 128];

            b.iter(|| {
                for _ in 0..batch {
                    conn.publish("bench", &payload).unwrap();
                }
                for _ in 0..batch {
                    black_box(rx.recv().unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Routing into a saturated subscription (every message dropped)
fn bench_saturated_enqueue(c: &mut Criterion) {
    let (conn, _server) = Loopback::connect(ConnectionConfig::default(), Default::default()).unwrap();
    let sub = conn.subscribe_sync("bench").unwrap();
    sub.set_pending_limits(1, subflow::UNLIMITED).unwrap();
    conn.publish("bench", b"fill").unwrap();

    c.bench_function("saturated_enqueue", |b| {
        b.iter(|| conn.publish("bench", black_box(b"dropped")).unwrap());
    });
}

/// Channel mode into a caller-owned bounded channel
fn bench_channel_delivery(c: &mut Criterion) {
    let (conn, _server) = Loopback::connect(ConnectionConfig::default(), Default::default()).unwrap();
    let (tx, rx) = bounded(1024);
    let _sub = conn.chan_subscribe("bench", tx).unwrap();

    c.bench_function("channel_delivery", |b| {
        b.iter(|| {
            conn.publish("bench", b"payload").unwrap();
            black_box(rx.recv().unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_sync_round_trip,
    bench_async_dispatch,
    bench_saturated_enqueue,
    bench_channel_delivery
);
criterion_main!(benches);
