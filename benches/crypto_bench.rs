//! Cryptographic hot-path benchmarks.
//!
//! The record layer runs once per datagram, so seal/open throughput at
//! typical packet sizes bounds tunnel goodput.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use gametunnel::crypto::{derive_direction_keys, KeyPair, Role, SessionCrypto};

fn session_crypto() -> SessionCrypto {
    let client = KeyPair::generate();
    let server = KeyPair::generate();
    let shared = client.shared_secret(&server.public_bytes()).unwrap();
    let keys = derive_direction_keys(&shared, "bench-psk").unwrap();
    SessionCrypto::new(&keys, Role::Client)
}

fn bench_x25519_keygen(c: &mut Criterion) {
    c.bench_function("x25519_keygen", |b| {
        b.iter(|| black_box(KeyPair::generate().public_bytes()))
    });
}

fn bench_x25519_dh(c: &mut Criterion) {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let bob_public = bob.public_bytes();

    c.bench_function("x25519_dh", |b| {
        b.iter(|| black_box(alice.shared_secret(&bob_public).unwrap()))
    });
}

fn bench_key_schedule(c: &mut Criterion) {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let shared = alice.shared_secret(&bob.public_bytes()).unwrap();

    c.bench_function("derive_direction_keys", |b| {
        b.iter(|| black_box(derive_direction_keys(&shared, "bench-psk").unwrap()))
    });
}

fn bench_seal(c: &mut Criterion) {
    let crypto = session_crypto();
    let plaintext = vec![0u8; 1200];
    let aad = [0xC0u8; 13];

    let mut group = c.benchmark_group("seal");
    group.throughput(Throughput::Bytes(1200));
    group.bench_function("1200_bytes", |b| {
        b.iter(|| black_box(crypto.seal(&plaintext, 1, &aad).unwrap()))
    });
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let client = KeyPair::generate();
    let server = KeyPair::generate();
    let client_shared = client.shared_secret(&server.public_bytes()).unwrap();
    let server_shared = server.shared_secret(&client.public_bytes()).unwrap();
    let sender = SessionCrypto::new(
        &derive_direction_keys(&client_shared, "").unwrap(),
        Role::Client,
    );
    let receiver = SessionCrypto::new(
        &derive_direction_keys(&server_shared, "").unwrap(),
        Role::Server,
    );

    let aad = [0xC0u8; 13];
    let ciphertext = sender.seal(&vec![0u8; 1200], 1, &aad).unwrap();

    let mut group = c.benchmark_group("open");
    group.throughput(Throughput::Bytes(1200));
    group.bench_function("1200_bytes", |b| {
        b.iter(|| black_box(receiver.open(&ciphertext, 1, &aad).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_x25519_keygen,
    bench_x25519_dh,
    bench_key_schedule,
    bench_seal,
    bench_open
);
criterion_main!(benches);
