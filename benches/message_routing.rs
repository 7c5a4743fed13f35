//! Message encode/decode and frame round-trip benchmarks (spec.md §4.1).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fluxbroker::message::{Identity, Message, MessageKind, Topic};

fn topic(s: &str) -> Topic {
    Topic::try_new(s).unwrap()
}

fn request_with_hops(hops: usize, payload_size: usize) -> Message {
    let payload = serde_json::json!({ "data": "x".repeat(payload_size) });
    let mut msg = Message::request(topic("kvs.get"), Some(payload));
    for i in 0..hops {
        msg.push_identity(Identity::try_new(format!("rank-{i}")).unwrap());
    }
    msg
}

fn bench_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_decode");
    for payload_size in [0, 64, 4096].iter() {
        group.throughput(Throughput::Bytes(*payload_size as u64));
        group.bench_with_input(
            BenchmarkId::new("encode", payload_size),
            payload_size,
            |b, &payload_size| {
                let payload = serde_json::json!({ "data": "x".repeat(payload_size) });
                b.iter(|| {
                    let msg = Message::encode(topic("kvs.get"), Some(payload.clone())).unwrap();
                    black_box(msg);
                });
            },
        );
    }
    group.finish();
}

fn bench_frame_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_round_trip");
    for hops in [0, 1, 4, 16].iter() {
        group.bench_with_input(BenchmarkId::new("to_from_frames", hops), hops, |b, &hops| {
            let msg = request_with_hops(hops, 256);
            b.iter(|| {
                let frames = msg.to_frames().unwrap();
                let decoded = Message::from_frames(MessageKind::Request, frames).unwrap();
                black_box(decoded);
            });
        });
    }
    group.finish();
}

fn bench_routing_stack_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing_stack");
    group.bench_function("push_pop_16_hops", |b| {
        b.iter(|| {
            let mut msg = Message::request(topic("kvs.get"), None);
            for i in 0..16 {
                msg.push_identity(Identity::try_new(format!("rank-{i}")).unwrap());
            }
            while msg.pop_identity().is_some() {}
            black_box(&msg);
        });
    });
    group.bench_function("routing_stack_contains_miss", |b| {
        let msg = request_with_hops(16, 0);
        let needle = Identity::try_new("rank-absent").unwrap();
        b.iter(|| black_box(msg.routing_stack_contains(&needle)));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_encode_decode,
    bench_frame_round_trip,
    bench_routing_stack_ops
);
criterion_main!(benches);
