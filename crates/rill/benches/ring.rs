// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Ring buffer throughput: write+read cycles at typical frame sizes.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rill::ring::{RingBuffer, SpscRing};

fn bench_spsc(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_ring");

    for &chunk in &[16usize, 64, 256] {
        group.throughput(Throughput::Elements(chunk as u64));
        group.bench_function(format!("write_read_{chunk}"), |b| {
            let ring = SpscRing::<f32, 4096>::new();
            let src: Vec<f32> = (0..chunk).map(|i| i as f32).collect();
            let mut dst = vec![0.0f32; chunk];
            b.iter(|| {
                assert!(ring.write(black_box(&src)));
                assert!(ring.read(black_box(&mut dst)));
            });
        });
    }

    group.finish();
}

fn bench_multi_reader(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_reader_ring");

    group.throughput(Throughput::Elements(64));
    group.bench_function("write_read_3_readers", |b| {
        let ring = RingBuffer::<f32, 4096, 3>::new();
        let src: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let mut dst = vec![0.0f32; 64];
        b.iter(|| {
            assert!(ring.write(black_box(&src)));
            for reader in 0..3 {
                assert!(ring.read_from(reader, black_box(&mut dst)));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_spsc, bench_multi_reader);
criterion_main!(benches);
