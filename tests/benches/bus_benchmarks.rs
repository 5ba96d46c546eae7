//! # Peerbus Benchmarks
//!
//! Hot paths of the inbound and outbound pipelines:
//!
//! | Area | Operation |
//! |------|-----------|
//! | Emitter | dispatch to exact, namespace and global listeners |
//! | Router | fan-out with per-peer sequence stamping |
//! | Codec | envelope encode / validate / decode |
//! | Causal buffer | reordering a reversed burst |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use peerbus_core::domain::{
    CausalOrderer, EventEmitter, ListenerOptions, PeerOptions, PeerRegistry, RouteOptions,
    SendFn, VectorClock,
};
use peerbus_types::{Envelope, MessageType};
use serde_json::json;
use std::sync::Arc;

// ============================================================================
// Emitter
// ============================================================================

fn bench_emitter_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("emitter");

    for listeners in [1usize, 10, 100] {
        let emitter = EventEmitter::new();
        let mut subs = Vec::with_capacity(listeners * 3);
        for _ in 0..listeners {
            subs.push(emitter.on("chat:message", |_e| Ok(()), ListenerOptions::default()));
            subs.push(emitter.on("chat:*", |_e| Ok(()), ListenerOptions::default()));
            subs.push(emitter.on("*", |_e| Ok(()), ListenerOptions::default()));
        }

        group.throughput(Throughput::Elements((listeners * 3) as u64));
        group.bench_with_input(
            BenchmarkId::new("emit", listeners),
            &listeners,
            |b, _| b.iter(|| black_box(emitter.emit("chat:message", json!({ "text": "hi" })))),
        );
        drop(subs);
    }
    group.finish();
}

// ============================================================================
// Router
// ============================================================================

fn bench_router_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");

    for peers in [4usize, 32, 128] {
        let registry = PeerRegistry::new(peers, 16, 3);
        for i in 0..peers {
            let send: SendFn = Arc::new(|env: &Envelope| {
                black_box(env.id());
                Ok(())
            });
            let _ = registry.add_peer(&format!("peer-{i}"), send, PeerOptions::default());
        }
        let envelope = Envelope::new(
            MessageType::Signal,
            json!({ "name": "tick", "data": { "n": 1 } }),
        )
        .with_source("bench");
        let stamped = RouteOptions {
            exclude: Vec::new(),
            stamp: true,
        };

        group.throughput(Throughput::Elements(peers as u64));
        group.bench_with_input(BenchmarkId::new("route_stamped", peers), &peers, |b, _| {
            b.iter(|| black_box(registry.route(&envelope, &stamped)))
        });
    }
    group.finish();
}

// ============================================================================
// Codec
// ============================================================================

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let envelope = Envelope::new(
        MessageType::Request,
        json!({ "handler": "orders.list", "args": { "page": 3, "filter": ["open", "paid"] } }),
    )
    .with_source("client")
    .with_target("server")
    .stamped(42);
    let wire = envelope.to_value();

    group.bench_function("encode", |b| b.iter(|| black_box(envelope.to_value())));
    group.bench_function("is_protocol_message", |b| {
        b.iter(|| black_box(peerbus_types::is_protocol_message(&wire)))
    });
    group.bench_function("decode", |b| {
        b.iter(|| black_box(Envelope::from_value(wire.clone())))
    });
    group.finish();
}

// ============================================================================
// Causal buffer
// ============================================================================

fn bench_causal_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("causal");

    for burst in [16u64, 256] {
        group.throughput(Throughput::Elements(burst));
        group.bench_with_input(BenchmarkId::new("reversed_burst", burst), &burst, |b, &n| {
            b.iter(|| {
                let mut orderer = CausalOrderer::new("bench", 1_000);
                let mut delivered = 0;
                for seq in (1..=n).rev() {
                    delivered += orderer
                        .receive("sender", VectorClock::single("sender", seq), seq)
                        .delivered
                        .len();
                }
                black_box(delivered)
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_emitter_dispatch,
    bench_router_fanout,
    bench_envelope_codec,
    bench_causal_reorder
);
criterion_main!(benches);
