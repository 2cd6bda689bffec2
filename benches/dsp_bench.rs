// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Benchmarks for the hot reconstruction kernels.
//!
//! Measures the per-ROI path (tap rotation, SNR voting) and the
//! whole-frame path (smoothing, binning) on realistic geometry.
//!
//! Run with: cargo bench --bench dsp_bench
//!
//! For on-target profiling, cross-compile and run:
//!   cargo bench --bench dsp_bench --target aarch64-unknown-linux-gnu

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use edgefirst_depthpub::{binning, dsp};

const ROI_ROWS: usize = 20;
const FOV_ROWS: usize = 480;
const WIDTH: usize = 640;

fn bench_tap_rotation(c: &mut Criterion) {
    let plane = ROI_ROWS * WIDTH * 3;
    let roi: Vec<f32> = (0..plane * 6).map(|i| (i % 4093) as f32).collect();
    let mut frame = vec![0.0f32; plane];

    let mut group = c.benchmark_group("tap_rotation");
    group.throughput(Throughput::Elements((ROI_ROWS * WIDTH) as u64));
    group.bench_function("20_rows", |b| {
        b.iter(|| dsp::tap_rotation(&roi, &mut frame, 0, (ROI_ROWS, WIDTH), true));
    });
    group.finish();
}

fn bench_snr_vote(c: &mut Criterion) {
    let plane = ROI_ROWS * WIDTH * 3;
    let roi0: Vec<f32> = (0..plane).map(|i| (i % 997) as f32 + 1.0).collect();
    let roi1: Vec<f32> = (0..plane).map(|i| (i % 991) as f32 + 1.0).collect();
    let mut fov0 = vec![0.0f32; FOV_ROWS * WIDTH * 3];
    let mut fov1 = vec![0.0f32; FOV_ROWS * WIDTH * 3];
    let mut snr = vec![0.0f32; FOV_ROWS * WIDTH];

    let mut group = c.benchmark_group("snr_vote");
    group.throughput(Throughput::Elements((ROI_ROWS * WIDTH) as u64));
    group.bench_function("20_rows", |b| {
        b.iter(|| dsp::snr_vote(&roi0, &roi1, &mut fov0, &mut fov1, &mut snr, 0));
    });
    group.finish();
}

fn bench_smooth_summed(c: &mut Criterion) {
    let size = (FOV_ROWS / 2, WIDTH / 2);
    let raw: Vec<f32> = (0..size.0 * size.1 * 3).map(|i| (i % 3001) as f32).collect();
    let mut out = vec![0.0f32; raw.len()];

    let mut group = c.benchmark_group("smooth_summed");
    group.throughput(Throughput::Elements((size.0 * size.1) as u64));
    group.bench_function("binned_2x2_5x7", |b| {
        b.iter(|| dsp::smooth_summed(&raw, &mut out, size, 2, 3));
    });
    group.finish();
}

fn bench_binning(c: &mut Criterion) {
    let raw = vec![1.0f32; FOV_ROWS * WIDTH * 3];
    let mut binned = vec![0.0f32; (FOV_ROWS / 2) * (WIDTH / 2) * 3];

    let mut group = c.benchmark_group("binning");
    group.throughput(Throughput::Elements((FOV_ROWS * WIDTH) as u64));
    group.bench_function("2x2_full_frame", |b| {
        b.iter(|| binning::bin_mxn(&raw, &mut binned, (FOV_ROWS, WIDTH), 2));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_tap_rotation,
    bench_snr_vote,
    bench_smooth_summed,
    bench_binning
);
criterion_main!(benches);
