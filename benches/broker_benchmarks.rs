use std::{
    hint::black_box,
    time::{Duration, Instant},
};

use bytes::Bytes;
use courier::{pubsub::TopicPattern, Broker, BrokerConfig, SubscriptionConfig};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

const DRAIN_EVERY: usize = 1024;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn broker_with_subscribers(
    rt: &Runtime,
    n: usize,
) -> (Broker, Vec<courier::SubscriptionId>) {
    rt.block_on(async {
        let broker = Broker::new(BrokerConfig::default());
        let subs = (0..n)
            .map(|_| {
                broker
                    .subscribe(
                        "bench.*",
                        SubscriptionConfig::default().with_mailbox_capacity(DRAIN_EVERY * 2),
                    )
                    .unwrap()
            })
            .collect();
        (broker, subs)
    })
}

/// Забирает и подтверждает всё накопленное, чтобы ящики не переполнялись
/// между итерациями.
fn drain(
    broker: &Broker,
    subs: &[courier::SubscriptionId],
) {
    for &id in subs {
        while let Ok(d) = broker.try_receive(id) {
            broker.ack(d.token()).unwrap();
        }
    }
}

fn bench_publish_fan_out(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("publish_fan_out");

    for n in [0usize, 1, 10, 100] {
        let (broker, subs) = broker_with_subscribers(&rt, n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.to_async(&rt).iter_custom(|iters| {
                let broker = &broker;
                let subs = &subs;
                async move {
                    let mut total = Duration::ZERO;
                    for i in 0..iters as usize {
                        let start = Instant::now();
                        broker
                            .publish("bench.event", black_box(Bytes::from_static(b"payload")))
                            .await
                            .unwrap();
                        total += start.elapsed();
                        if (i + 1) % DRAIN_EVERY == 0 {
                            drain(broker, subs);
                        }
                    }
                    drain(broker, subs);
                    total
                }
            });
        });
    }
    group.finish();
}

fn bench_pattern_matching(c: &mut Criterion) {
    let patterns = [
        ("exact", "orders.eu.created"),
        ("single", "orders.*.created"),
        ("rest", "orders.**"),
    ];
    let topic = "orders.eu.created";

    let mut group = c.benchmark_group("pattern_matching");
    for (name, raw) in patterns {
        let parsed = TopicPattern::parse(raw).unwrap();
        group.bench_function(BenchmarkId::new("parsed", name), |b| {
            b.iter(|| black_box(parsed.matches(black_box(topic))))
        });
        group.bench_function(BenchmarkId::new("raw", name), |b| {
            b.iter(|| black_box(courier::pubsub::matches(black_box(raw), black_box(topic))))
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let (broker, subs) = broker_with_subscribers(&rt, 1);
    let sub = subs[0];

    c.bench_function("publish_receive_ack", |b| {
        b.to_async(&rt).iter(|| async {
            broker
                .publish("bench.event", Bytes::from_static(b"payload"))
                .await
                .unwrap();
            let d = broker
                .receive_timeout(sub, Duration::from_secs(1))
                .await
                .unwrap();
            broker.ack(black_box(d.token())).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_publish_fan_out,
    bench_pattern_matching,
    bench_round_trip
);
criterion_main!(benches);
