//! Cipher benchmarks

use criterion::{criterion_group, criterion_main, Criterion};
use mpq_archive::crypto::{decrypt_block, encrypt_block};
use std::hint::black_box;

fn bench_encrypt_block(c: &mut Criterion) {
    let mut data = vec![0x12345678u32; 1024]; // one 4 KiB sector
    let key = 0xC1EB1CEF;

    c.bench_function("encrypt_block_4kb", |b| {
        b.iter(|| {
            encrypt_block(&mut data, black_box(key));
        });
    });
}

fn bench_decrypt_block(c: &mut Criterion) {
    let mut data = vec![0x12345678u32; 1024];
    let key = 0xC1EB1CEF;

    c.bench_function("decrypt_block_4kb", |b| {
        b.iter(|| {
            decrypt_block(&mut data, black_box(key));
        });
    });
}

criterion_group!(benches, bench_encrypt_block, bench_decrypt_block);
criterion_main!(benches);
