//! # Substrate Benchmarks
//!
//! Performance benchmarks for projection, Hilbert encoding and the pure
//! compute service.
//!
//! Run with: `cargo bench -p substrate-core`

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use substrate_core::{
    ChildHandle, ProjectedAtoms, compute_composition, compute_relation, compute_sequence,
    project, spatial,
};

const SENTENCE: &str = "the quick brown fox jumps over the lazy dog";

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection");
    let block: u32 = 4096;
    group.throughput(Throughput::Elements(u64::from(block)));

    for start in [0u32, 0x4e00, 0x10_0000] {
        group.bench_with_input(BenchmarkId::new("block", format!("{start:#x}")), &start, |b, &start| {
            b.iter(|| {
                for cp in start..start + block {
                    black_box(project(black_box(cp)));
                }
            });
        });
    }

    group.finish();
}

fn bench_hilbert(c: &mut Criterion) {
    let points: Vec<_> = (0..4096u32)
        .filter_map(|cp| project(cp.wrapping_mul(269)))
        .map(|p| p.position)
        .collect();

    let mut group = c.benchmark_group("hilbert");
    group.throughput(Throughput::Elements(points.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| {
            for p in &points {
                black_box(spatial::encode(black_box(p)));
            }
        });
    });
    group.finish();
}

fn bench_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute");

    for word in ["a", "fox", "internationalization"] {
        group.bench_with_input(BenchmarkId::new("composition", word.len()), &word, |b, word| {
            b.iter(|| black_box(compute_composition(black_box(word), &ProjectedAtoms)));
        });
    }

    let words: Vec<_> = SENTENCE
        .split_whitespace()
        .filter_map(|w| compute_composition(w, &ProjectedAtoms).into_valid())
        .map(|bundle| bundle.handle)
        .collect();
    let children: Vec<ChildHandle> = words.iter().map(ChildHandle::from).collect();

    group.bench_function("sentence", |b| {
        b.iter(|| black_box(compute_sequence(black_box(&children))));
    });

    let source = words[0].hash;
    group.bench_function("relation", |b| {
        b.iter(|| black_box(compute_relation(&words[1], &words[2], source, 1000)));
    });

    group.finish();
}

criterion_group!(benches, bench_projection, bench_hilbert, bench_compute);
criterion_main!(benches);
