//! Masking kernel benchmarks
//!
//! Run with: cargo bench --bench masking

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use hubsock::mask::{apply_mask, apply_mask_offset, unmask_segments};

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn bench_apply_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_mask");

    for size in [64usize, 1024, 16 * 1024, 256 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            let mut data = vec![0xABu8; size];
            b.iter(|| {
                apply_mask(black_box(&mut data), black_box(MASK));
            });
        });
    }

    group.finish();
}

fn bench_offset_tail(c: &mut Criterion) {
    // Worst case for the tail switch: unaligned start, length not a
    // multiple of the word size
    c.bench_function("apply_mask_offset/1027B+3", |b| {
        let mut data = vec![0xCDu8; 1027];
        b.iter(|| {
            apply_mask_offset(black_box(&mut data), black_box(MASK), black_box(3));
        });
    });
}

fn bench_segmented(c: &mut Criterion) {
    // A 64KB payload split across pool blocks, the shape the ingress path
    // produces
    c.bench_function("unmask_segments/8x8KB", |b| {
        let mut segments: Vec<Vec<u8>> = (0..8).map(|_| vec![0xEFu8; 8 * 1024]).collect();
        b.iter(|| {
            unmask_segments(black_box(&mut segments), black_box(MASK));
        });
    });
}

criterion_group!(benches, bench_apply_mask, bench_offset_tail, bench_segmented);
criterion_main!(benches);
