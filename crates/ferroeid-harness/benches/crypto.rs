//! Primitive benchmarks: the operations the waiting-time extension hook
//! exists for.

use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use ferroeid_core::crypto::bn::Bn;
use ferroeid_core::crypto::ec::{Curve, CurveId};
use ferroeid_core::crypto::rsa;

fn bench_rsa(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let (key, n) = rsa::generate_key(512, &mut rng).unwrap();
    let msg = Bn::from_bytes_be(&[0x42; 48]).rem(&n);

    c.bench_function("rsa512_private_op", |b| {
        b.iter(|| rsa::private_op(&key, &msg, &mut rng).unwrap())
    });
    c.bench_function("rsa512_keygen", |b| {
        b.iter(|| rsa::generate_key(512, &mut rng).unwrap())
    });
}

fn bench_ec(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let curve = Curve::get(CurveId::P256);
    let (d, _) = curve.generate_key(&mut rng).unwrap();
    let hash = [0xA5u8; 32];

    c.bench_function("p256_ecdsa_sign", |b| {
        b.iter(|| curve.ecdsa_sign(&d, &hash, &mut rng).unwrap())
    });
}

criterion_group!(benches, bench_rsa, bench_ec);
criterion_main!(benches);
