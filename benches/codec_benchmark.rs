use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

use siamese::galois::{gf_add_mem, gf_muladd_mem};
use siamese::params::{add_columns, Pcg};
use siamese::{Decoder, Encoder};

const SEED: u64 = 1013;

fn payload_for(column: u32, len: usize) -> Vec<u8> {
    let mut prng = Pcg::new(SEED, column as u64);
    (0..len).map(|_| prng.next() as u8).collect()
}

/// Raw field throughput: the muladd kernel dominates recovery generation
fn bench_gf_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("gf256_kernels");

    for size in [64usize, 576, 1300] {
        let src = payload_for(1, size);

        group.bench_with_input(BenchmarkId::new("add_mem", size), &size, |b, _| {
            let mut dst = vec![0x55u8; size];
            b.iter(|| gf_add_mem(black_box(&mut dst), black_box(&src)));
        });

        group.bench_with_input(BenchmarkId::new("muladd_mem", size), &size, |b, _| {
            let mut dst = vec![0x55u8; size];
            b.iter(|| gf_muladd_mem(black_box(&mut dst), 0xC3, black_box(&src)));
        });
    }

    group.finish();
}

/// Recovery generation cost should stay flat as the window grows
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoder");

    for window in [32u32, 256, 2048] {
        group.bench_with_input(
            BenchmarkId::new("encode_window", window),
            &window,
            |b, &window| {
                let mut encoder = Encoder::new();
                for column in 0..window {
                    encoder.add(&payload_for(column, 576)).unwrap();
                }
                b.iter(|| black_box(encoder.encode().unwrap()));
            },
        );
    }

    group.bench_function("add_576B", |b| {
        let mut encoder = Encoder::new();
        let payload = payload_for(0, 576);
        b.iter(|| {
            if encoder.window_count() >= 4096 {
                let trim_to = add_columns(encoder.column_start(), 2048);
                encoder.remove_before(trim_to).unwrap();
            }
            black_box(encoder.add(&payload).unwrap());
        });
    });

    group.finish();
}

/// Full loss-recovery round trips at a few burst sizes
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decoder");
    group.sample_size(20);

    for losses in [1usize, 8, 32] {
        let window = 256u32;
        let mut encoder = Encoder::new();
        for column in 0..window {
            encoder.add(&payload_for(column, 576)).unwrap();
        }
        let recoveries: Vec<Vec<u8>> = (0..losses + 4).map(|_| encoder.encode().unwrap()).collect();

        group.bench_with_input(BenchmarkId::new("solve_burst", losses), &losses, |b, _| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                for column in losses as u32..window {
                    decoder
                        .add_original(column, &payload_for(column, 576))
                        .unwrap();
                }
                for recovery in &recoveries {
                    decoder.add_recovery(recovery).unwrap();
                }
                black_box(decoder.decode().unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_gf_kernels, bench_encode, bench_decode);
criterion_main!(benches);
