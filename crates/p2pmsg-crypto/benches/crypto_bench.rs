//! Microbenchmarks for the primitive wrappers.
//!
//! Run with: `cargo bench -p p2pmsg-crypto`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use p2pmsg_crypto::aead::{AeadCipher, AeadKey};
use p2pmsg_crypto::kdf::{Argon2Params, argon2id, hkdf32};
use p2pmsg_crypto::signatures::SigningKey;
use p2pmsg_crypto::x25519::PrivateKey;
use rand_core::OsRng;

fn bench_aead_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("aead_seal");
    let key = AeadKey::new([0x42u8; 32]);
    let cipher = AeadCipher::new(&key);
    let nonce = [0u8; 12];

    for size in [64usize, 1024, 16384] {
        let plaintext = vec![0xAAu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| cipher.seal(black_box(&nonce), black_box(b"aad"), black_box(&plaintext)))
        });
    }
    group.finish();
}

fn bench_x25519_exchange(c: &mut Criterion) {
    let a = PrivateKey::generate(&mut OsRng);
    let b = PrivateKey::generate(&mut OsRng);
    let b_pub = b.public_key();

    c.bench_function("x25519_exchange", |bencher| {
        bencher.iter(|| a.exchange(black_box(&b_pub)))
    });
}

fn bench_ed25519_sign(c: &mut Criterion) {
    let key = SigningKey::generate(&mut OsRng);
    let msg = b"HELLO handshake payload";

    c.bench_function("ed25519_sign", |b| b.iter(|| key.sign(black_box(msg))));
}

fn bench_hkdf(c: &mut Criterion) {
    let ikm = [7u8; 32];
    c.bench_function("hkdf32", |b| {
        b.iter(|| hkdf32(black_box(&ikm), b"salt", b"p2pmsg v1 session"))
    });
}

fn bench_argon2id(c: &mut Criterion) {
    // Deliberately cheap parameters: the real vault cost (100 MiB) would make
    // this benchmark take minutes per sample.
    let params = Argon2Params {
        time_cost: 1,
        memory_kib: 8 * 1024,
        parallelism: 1,
    };
    c.bench_function("argon2id_8mib", |b| {
        b.iter(|| argon2id(black_box(b"passphrase"), black_box(&[0u8; 16]), params))
    });
}

criterion_group!(
    benches,
    bench_aead_seal,
    bench_x25519_exchange,
    bench_ed25519_sign,
    bench_hkdf,
    bench_argon2id
);
criterion_main!(benches);
