//! Microbenchmarks for the record layer's hot path: sealing and opening
//! frames at conversational throughput.
//!
//! Run with: `cargo bench -p p2pmsg-core`

use criterion::{criterion_group, criterion_main, black_box, BenchmarkId, Criterion, Throughput};
use p2pmsg_core::config::Config;
use p2pmsg_core::frame::MessageType;
use p2pmsg_core::handshake::Role;
use p2pmsg_core::record::RecordLayer;

fn bench_seal(c: &mut Criterion) {
    let config = Config::default();
    let mut group = c.benchmark_group("record_seal");

    for size in [64usize, 1024, 16384] {
        let mut layer = RecordLayer::new([0x11u8; 32], Role::Initiator, [1u8; 32], [2u8; 32], &config);
        let plaintext = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| layer.seal(black_box(MessageType::Text), black_box(&plaintext), black_box(1_700_000_000)))
        });
    }
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let config = Config::default();
    let mut group = c.benchmark_group("record_open");

    for size in [64usize, 1024, 16384] {
        let mut sender = RecordLayer::new([0x22u8; 32], Role::Initiator, [1u8; 32], [2u8; 32], &config);
        let mut receiver = RecordLayer::new([0x22u8; 32], Role::Responder, [2u8; 32], [1u8; 32], &config);
        let plaintext = vec![0xCDu8; size];
        let now = 1_700_000_000;
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter_batched(
                || sender.seal(MessageType::Text, &plaintext, now).unwrap(),
                |sealed| receiver.open(black_box(MessageType::Text), black_box(&sealed.payload), black_box(now)),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_seal, bench_open);
criterion_main!(benches);
