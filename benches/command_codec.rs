//! Command codec benchmark suite.
//!
//! Measures the per-command costs paid on every frame:
//! - Header decoding of received payloads
//! - Command name lookup used by command logging
//! - Command encoding for outbound frames
//!
//! Run with: cargo bench --bench command_codec
//! Results saved to: target/criterion/

use std::hint::black_box;

use arsdk_core::protocol::{Command, FeatureId, command_name};
use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const ARG_SIZES: &[usize] = &[0, 8, 64, 512];

/// Known `(feature, command)` pairs spread over the command table.
const LOOKUPS: &[(u16, u16)] = &[(0x0100, 1), (0x0100, 2), (0x0104, 4), (0x0005, 1)];

// ============================================================================
// Benchmark: Decoding
// ============================================================================

fn bench_from_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("from_bytes");

    for &size in ARG_SIZES {
        let data = Command::new(FeatureId::new(1, 4), 4, &vec![0xA5; size])
            .data()
            .clone();
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| Command::from_bytes(black_box(Bytes::clone(data))));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Name Lookup
// ============================================================================

fn bench_command_name(c: &mut Criterion) {
    c.bench_function("command_name/known", |b| {
        b.iter(|| {
            for &(feature, command) in LOOKUPS {
                black_box(command_name(FeatureId::from_raw(feature), command));
            }
        });
    });

    c.bench_function("command_name/unknown", |b| {
        b.iter(|| command_name(black_box(FeatureId::new(0xEE, 0xEE)), black_box(1)));
    });
}

// ============================================================================
// Benchmark: Encoding
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for &size in ARG_SIZES {
        let args = vec![0x5A; size];
        group.throughput(Throughput::Bytes((size + 4) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &args, |b, args| {
            b.iter(|| Command::new(FeatureId::new(1, 0), 2, black_box(args)));
        });
    }

    group.finish();
}

// ============================================================================
// Main
// ============================================================================

criterion_group!(benches, bench_from_bytes, bench_command_name, bench_encode);
criterion_main!(benches);
