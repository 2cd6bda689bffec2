// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! iTOF signal-processing kernels.
//!
//! Everything here operates on flat `f32` slices holding raw pixel
//! triplets (A, B, C) or per-pixel scalar fields. Raw input arrives
//! scaled x2 by the FPGA and is right-shifted by one on ingest, so the
//! effective scale inside these kernels is 1:1 with sensor counts. All
//! kernels are single-threaded per FOV.

use crate::metadata::{C_MPS, NUM_PHASES};
use crate::pool;

/// Separable smoothing kernels, selected by index. Index 0 is the
/// identity (smoothing disabled).
pub static F_KERNELS: [&[f32]; 7] = [
    &[0.0, 1.0, 0.0],
    &[1.968_413_9e-1, 6.063_172_2e-1, 1.968_413_9e-1],
    &[
        6.646_033e-3,
        1.942_255_5e-1,
        5.982_568_3e-1,
        1.942_255_5e-1,
        6.646_033e-3,
    ],
    &[
        4.433_048_2e-3,
        5.400_558_3e-2,
        2.420_362_3e-1,
        3.990_502_8e-1,
        2.420_362_3e-1,
        5.400_558_3e-2,
        4.433_048_2e-3,
    ],
    &[
        3.325_727_1e-3,
        2.381_792_2e-2,
        9.719_199_2e-2,
        2.259_781_5e-1,
        2.993_724_1e-1,
        2.259_781_5e-1,
        9.719_199_2e-2,
        2.381_792_2e-2,
        3.325_727_1e-3,
    ],
    &[
        2.661_264_7e-3,
        1.344_761_1e-2,
        4.740_849_6e-2,
        1.166_060_8e-1,
        2.000_968_4e-1,
        2.395_594_1e-1,
        2.000_968_4e-1,
        1.166_060_8e-1,
        4.740_849_6e-2,
        1.344_761_1e-2,
        2.661_264_7e-3,
    ],
    &[
        1.901_645_6e-3,
        6.275_148_5e-3,
        1.723_257_1e-2,
        3.938_290_5e-2,
        7.490_262_9e-2,
        1.185_544_9e-1,
        1.561_602_7e-1,
        1.711_806_8e-1,
        1.561_602_7e-1,
        1.185_544_9e-1,
        7.490_262_9e-2,
        3.938_290_5e-2,
        1.723_257_1e-2,
        6.275_148_5e-3,
        1.901_645_6e-3,
    ],
];

/// Stripe-mode vertical collapse windows and their effective number of
/// summed values.
pub static GAUSSIAN6: [f32; 6] = [
    0.457_833_35,
    0.754_839_6,
    0.969_233_2,
    0.969_233_2,
    0.754_839_6,
    0.457_833_35,
];
pub const GAUSSIAN6_SUMS: f32 = 4.363_812_4;

pub static GAUSSIAN8: [f32; 8] = [
    0.216_265_17,
    0.457_833_35,
    0.754_839_6,
    0.969_233_2,
    0.969_233_2,
    0.754_839_6,
    0.457_833_35,
    0.216_265_17,
];
pub const GAUSSIAN8_SUMS: f32 = 4.796_342_8;

pub static RECT6: [f32; 6] = [1.0; 6];
pub const RECT6_SUMS: f32 = 6.0;

pub static RECT8: [f32; 8] = [1.0; 8];
pub const RECT8_SUMS: f32 = 8.0;

/// Convert little-endian `u16` raw words to floats, masking and shifting.
pub fn sh2f(src: &[u8], dst: &mut [f32], shiftr: u32, mask: u16) {
    debug_assert!(src.len() >= dst.len() * 2);
    for (i, out) in dst.iter_mut().enumerate() {
        let word = u16::from_le_bytes([src[2 * i], src[2 * i + 1]]);
        *out = f32::from((word & mask) >> shiftr);
    }
}

/// Sum the three tap-rotation permutations of one frequency into `frame`.
///
/// The raw ROI holds six planes of `rows * cols` triplets ordered
/// permutation-major: [p0f0, p0f1, p1f0, p1f1, p2f0, p2f1]. Each output
/// component is the cyclic-shift sum out_A = A0+B1+C2, out_B = B0+C1+A2,
/// out_C = C0+A1+B2. When the hardware already reduced the taps the
/// single permutation is copied through unchanged.
pub fn tap_rotation(
    roi: &[f32],
    frame: &mut [f32],
    freq_idx: usize,
    roi_size: (usize, usize),
    do_rotation: bool,
) {
    let (rows, cols) = roi_size;
    let plane = rows * cols * NUM_PHASES;
    debug_assert_eq!(frame.len(), plane);

    if !do_rotation {
        let start = freq_idx * plane;
        if start + plane > roi.len() {
            return; // buffer mis-sized
        }
        frame.copy_from_slice(&roi[start..start + plane]);
        return;
    }

    if roi.len() < (4 + freq_idx) * plane + plane {
        return;
    }
    let abc1 = &roi[freq_idx * plane..];
    let abc2 = &roi[(2 + freq_idx) * plane..];
    let abc3 = &roi[(4 + freq_idx) * plane..];

    for idx in 0..rows * cols {
        let p = NUM_PHASES * idx;
        let (a1, b1, c1) = (abc1[p], abc1[p + 1], abc1[p + 2]);
        let (a2, b2, c2) = (abc2[p], abc2[p + 1], abc2[p + 2]);
        let (a3, b3, c3) = (abc3[p], abc3[p + 1], abc3[p + 2]);
        frame[p] = a1 + b2 + c3;
        frame[p + 1] = b1 + c2 + a3;
        frame[p + 2] = c1 + a2 + b3;
    }
}

/// snr^2 for one raw triplet, after rotating so C holds the minimum.
#[inline]
pub fn snr_squared(roi: &[f32], idx: usize) -> f32 {
    let p = idx * NUM_PHASES;
    let (mut a, mut b, mut c) = (roi[p], roi[p + 1], roi[p + 2]);

    if a <= b && a <= c {
        let tmp = c;
        c = a;
        a = b;
        b = tmp;
    } else if b <= c && b < a {
        let tmp = a;
        a = c;
        c = b;
        b = tmp;
    }

    let num = a + b - 2.0 * c;
    num * num / (2.0 * c)
}

/// SNR-vote one ROI strip into the full-FOV raw buffers.
///
/// For each triplet the combined snr^2 of both frequencies competes with
/// the per-pixel best seen so far this FOV; a win replaces both stored
/// triplets and the stored snr.
pub fn snr_vote(
    roi0: &[f32],
    roi1: &[f32],
    fov0: &mut [f32],
    fov1: &mut [f32],
    snr_fov: &mut [f32],
    fov_offset: usize,
) {
    debug_assert_eq!(roi0.len(), roi1.len());
    let num = roi0.len() / NUM_PHASES;

    for idx in 0..num {
        let snr = snr_squared(roi0, idx) + snr_squared(roi1, idx);
        if snr > snr_fov[idx + fov_offset] {
            let p = idx * NUM_PHASES;
            let o = NUM_PHASES * fov_offset + p;
            fov0[o..o + 3].copy_from_slice(&roi0[p..p + 3]);
            fov1[o..o + 3].copy_from_slice(&roi1[p..p + 3]);
            snr_fov[idx + fov_offset] = snr;
        }
    }
}

/// Replace rows the scan never touched with the average of the nearest
/// filled neighbors; a single neighbor replicates, none leaves zeros.
pub fn fill_missing_rows(frame: &[f32], out: &mut [f32], size: (usize, usize), active: &[bool]) {
    let (rows, cols) = size;
    let stride = cols * NUM_PHASES;

    if rows < 3 {
        out[..frame.len()].copy_from_slice(frame);
        return;
    }

    let bottom = (rows - 1) * stride;
    out[..stride].copy_from_slice(&frame[..stride]);
    out[bottom..bottom + stride].copy_from_slice(&frame[bottom..bottom + stride]);

    for row in 1..rows - 1 {
        let this = active[row];
        let up = active[row - 1];
        let down = active[row + 1];
        let base = row * stride;
        for col in 0..stride {
            let idx = base + col;
            out[idx] = if !this && up && down {
                0.5 * (frame[idx - stride] + frame[idx + stride])
            } else if !this && up {
                frame[idx - stride]
            } else if !this && down {
                frame[idx + stride]
            } else {
                frame[idx]
            };
        }
    }
}

/// First-stage phase computation over raw triplets.
///
/// phase = (1/3)(B-C)/(A+B-2C) + the rotation's fractional offset;
/// signal = A+B-2C; snr = signal/sqrt(2C); background = C. Signal and
/// background are divided by the number of summed raw values before
/// accumulation; signal, snr, and background accumulate across the two
/// frequencies, so those outputs must be zeroed before the first call.
pub fn calculate_phase(
    raw: &[f32],
    phase: &mut [f32],
    signal: &mut [f32],
    snr: &mut [f32],
    background: &mut [f32],
    number_of_summed: f32,
) {
    const ONE_THIRD: f32 = 1.0 / 3.0;
    const TWO_THIRDS: f32 = 2.0 / 3.0;

    for idx in 0..phase.len() {
        let p = idx * NUM_PHASES;
        let (mut a, mut b, mut c) = (raw[p], raw[p + 1], raw[p + 2]);

        let mut frac = 0.0;
        if a <= b && a <= c {
            let tmp = c;
            c = a;
            a = b;
            b = tmp;
            frac = ONE_THIRD;
        } else if b <= c && b < a {
            let tmp = a;
            a = c;
            c = b;
            b = tmp;
            frac = TWO_THIRDS;
        }

        let mut sig = a + b - 2.0 * c;
        let iphase;
        let isnr;
        if sig <= 0.0 {
            sig = 0.0;
            iphase = 0.0;
            isnr = 0.0;
            c = 0.0;
        } else {
            iphase = ONE_THIRD * ((b - c) / sig) + frac;
            let clip = 1.0 / 65535.0;
            if c < clip {
                c = clip; // overflow prevention
            }
            isnr = sig / (2.0 * c).sqrt();
        }

        phase[idx] = iphase;
        signal[idx] += sig / number_of_summed;
        snr[idx] += isnr;
        background[idx] += c / number_of_summed;
    }
}

const MAX_PHASE_ERROR: f32 = 0.5;

/// Recompute phase from smoothed raw triplets and correct the unsmoothed
/// phase by a full cycle wherever it disagrees by more than half a cycle.
pub fn calculate_phase_smooth(
    smoothed_raw: &[f32],
    phase_smoothed: &mut [f32],
    phase: &[f32],
    corrected: &mut [f32],
) {
    const ONE_THIRD: f32 = 1.0 / 3.0;
    const TWO_THIRDS: f32 = 2.0 / 3.0;
    debug_assert_eq!(NUM_PHASES * phase_smoothed.len(), smoothed_raw.len());

    for idx in 0..phase_smoothed.len() {
        let p = idx * NUM_PHASES;
        let (mut a, mut b, mut c) = (smoothed_raw[p], smoothed_raw[p + 1], smoothed_raw[p + 2]);

        let mut frac = 0.0;
        if a <= b && a <= c {
            let tmp = c;
            c = a;
            a = b;
            b = tmp;
            frac = ONE_THIRD;
        } else if b <= c && b < a {
            let tmp = a;
            a = c;
            c = b;
            b = tmp;
            frac = TWO_THIRDS;
        }

        let mut smoothed = 0.0;
        let mut raw_phase = 0.0;
        let signal = a + b - 2.0 * c;
        if signal > 0.0 {
            smoothed = ONE_THIRD * ((b - c) / signal) + frac;
            raw_phase = phase[idx];
        }

        phase_smoothed[idx] = smoothed;
        corrected[idx] = raw_phase;

        let err = raw_phase - smoothed;
        if err > MAX_PHASE_ERROR {
            corrected[idx] -= 1.0;
        }
        if err < -MAX_PHASE_ERROR {
            corrected[idx] += 1.0;
        }
    }
}

/// Resolve aliasing across the two modulation frequencies and compute
/// per-pixel range.
///
/// With integer period ratios n0 = f0/GCF and n1 = f1/GCF:
/// mask = 1 when phase1 < phase0, m = round(n0*phase1 - n1*phase0 +
/// n0*mask), range = (c/(4 f1))(m + phase1 + mask) + (c/(4 f0))(m +
/// phase0), clamped at zero. The exported M image holds 2m + mask for the
/// min-max filter. The smoothed phases pick m; the corrected phases feed
/// the range.
#[allow(clippy::too_many_arguments)]
pub fn compute_range(
    smoothed0: &[f32],
    smoothed1: &[f32],
    corrected0: &[f32],
    corrected1: &[f32],
    ranges: &mut [f32],
    freqs: [f32; 2],
    fs_int: [f32; 2],
    m_frame: &mut [f32],
) {
    let a = 0.5 * C_MPS / (2.0 * freqs[1]);
    let c = 0.5 * C_MPS / (2.0 * freqs[0]);
    debug_assert_eq!(corrected0.len(), corrected1.len());

    for idx in 0..corrected0.len() {
        let s0 = smoothed0[idx];
        let s1 = smoothed1[idx];

        let mask = if s1 < s0 { 1.0 } else { 0.0 };
        let m = (fs_int[0] * s1 - fs_int[1] * s0 + fs_int[0] * mask).round();

        m_frame[idx] = m + m + mask;

        let b = m + corrected1[idx] + mask;
        let d = m + corrected0[idx];
        ranges[idx] = (a * b + c * d).max(0.0);
    }
}

/// Smooth binned raw triplets with the separable kernel pair selected by
/// `row_kernel_idx`/`column_kernel_idx`. Kernel index pair (0, 0) and
/// frames smaller than the kernels pass through unchanged. Border rows
/// and columns of half-kernel width are copied unfiltered.
pub fn smooth_summed(
    raw: &[f32],
    out: &mut [f32],
    size: (usize, usize),
    row_kernel_idx: usize,
    column_kernel_idx: usize,
) {
    let (rows, cols) = size;
    debug_assert_eq!(raw.len(), out.len());

    let row_kernel = F_KERNELS[row_kernel_idx];
    let column_kernel = F_KERNELS[column_kernel_idx];

    if (row_kernel_idx == 0 && column_kernel_idx == 0)
        || row_kernel.len() > cols
        || column_kernel.len() > rows
    {
        out.copy_from_slice(raw);
        return;
    }

    let ch = column_kernel.len() / 2;
    let rh = row_kernel.len() / 2;
    let stride = cols * NUM_PHASES;

    let mut temp = pool::scoped(raw.len());

    // Vertical pass.
    for row in 0..rows {
        let base = row * stride;
        if row < ch || row >= rows - ch {
            temp[base..base + stride].copy_from_slice(&raw[base..base + stride]);
            continue;
        }
        for col in 0..stride {
            let idx = base + col;
            let mut acc = 0.0;
            for (k, weight) in column_kernel.iter().enumerate() {
                let offset = (k as isize - ch as isize) * stride as isize;
                acc += weight * raw[(idx as isize + offset) as usize];
            }
            temp[idx] = acc;
        }
    }

    // Horizontal pass.
    for row in 0..rows {
        let base = row * stride;
        for col in 0..cols {
            let idx = base + col * NUM_PHASES;
            if col < rh || col >= cols - rh {
                out[idx..idx + 3].copy_from_slice(&temp[idx..idx + 3]);
                continue;
            }
            for comp in 0..NUM_PHASES {
                let mut acc = 0.0;
                for (k, weight) in row_kernel.iter().enumerate() {
                    let offset = (k as isize - rh as isize) * NUM_PHASES as isize;
                    acc += weight * temp[(idx as isize + offset) as usize + comp];
                }
                out[idx + comp] = acc;
            }
        }
    }
}

/// Min-max window geometry derived from the active smoothing kernels,
/// floored at 3x3.
pub fn min_max_filter_size(row_kernel_idx: usize, column_kernel_idx: usize) -> (usize, usize) {
    const MIN_SIZE: usize = 3;
    let v = (F_KERNELS[row_kernel_idx].len() / 2) & 1;
    let h = (F_KERNELS[column_kernel_idx].len() / 2) & 1;
    (v.max(MIN_SIZE), h.max(MIN_SIZE))
}

fn out_of_range_intra(
    frame: &[f32],
    mask: &[f32],
    idx: usize,
    offsets: &[isize],
    thresh: f32,
) -> bool {
    let mut min_val = f32::MAX;
    let mut max_val = f32::MIN;
    for &offset in offsets {
        let i = (idx as isize + offset) as usize;
        if mask[i] != 0.0 {
            continue;
        }
        let val = frame[i];
        if val < min_val {
            min_val = val;
        }
        if val > max_val {
            max_val = val;
        }
    }
    if min_val == f32::MAX || max_val == f32::MIN {
        return false; // no valid points in the window
    }
    max_val - min_val > thresh
}

fn min_max_intra(
    frame: &[f32],
    mask: &mut [f32],
    filter: (usize, usize),
    size: (usize, usize),
    thresh: f32,
) {
    mask.fill(0.0);

    let v = filter.0 | 1; // guarantee odd
    let h = filter.1 | 1;
    let (rows, cols) = size;
    let pitch = cols as isize;

    let mut offsets = Vec::with_capacity(v * h);
    for r in 0..v as isize {
        for c in 0..h as isize {
            offsets.push(pitch * (r - (v / 2) as isize) + (c - (h / 2) as isize));
        }
    }

    let num_rows = rows - v + 1;
    let num_cols = cols - h + 1;
    let mut idx_start = (v / 2) * cols + h / 2;
    for _ in 0..num_rows {
        let mut idx = idx_start;
        for _ in 0..num_cols {
            if out_of_range_intra(frame, mask, idx, &offsets, thresh) {
                mask[idx] = 1.0;
            }
            idx += 1;
        }
        idx_start += cols;
    }
}

/// Ghost mask over the M image: a window position is masked when the
/// spread of unmasked M values inside it exceeds the threshold. Run once
/// forward and once over the reversed frame; the published mask is the
/// product of both passes.
pub fn min_max_recursive(
    frame: &[f32],
    mask: &mut [f32],
    filter: Option<(usize, usize)>,
    size: (usize, usize),
    thresh: f32,
) {
    mask.fill(0.0);

    let filter = match filter {
        Some(f) => f,
        None => return, // filter disabled
    };
    if size.0 < filter.0 || size.1 < filter.1 {
        return;
    }

    min_max_intra(frame, mask, filter, size, thresh);

    let reversed: Vec<f32> = frame.iter().rev().copied().collect();
    let mut mask_reversed = vec![0.0f32; frame.len()];
    min_max_intra(&reversed, &mut mask_reversed, filter, size, thresh);
    mask_reversed.reverse();

    for (m, r) in mask.iter_mut().zip(mask_reversed.iter()) {
        *m *= r;
    }
}

fn median_offsets(pitch: isize, kernel_indices: (usize, usize)) -> Vec<isize> {
    let h = (F_KERNELS[kernel_indices.0].len() | 1) as isize;
    let v = (F_KERNELS[kernel_indices.1].len() | 1) as isize;

    let mut offsets = Vec::with_capacity((v + h - 1) as usize);
    for i in -h / 2..=h / 2 {
        offsets.push(i);
    }
    for i in -v / 2..0 {
        offsets.push(i * pitch);
    }
    for i in 1..=v / 2 {
        offsets.push(i * pitch);
    }
    offsets
}

/// Plus-shaped median over the range image, sized from the smoothing
/// kernels. Disabled or undersized frames pass through.
pub fn median_filter_plus(
    input: &[f32],
    out: &mut [f32],
    kernel_indices: (usize, usize),
    size: (usize, usize),
    enabled: bool,
) {
    out.copy_from_slice(input);
    if !enabled {
        return;
    }

    let h = F_KERNELS[kernel_indices.0].len() | 1;
    let v = F_KERNELS[kernel_indices.1].len() | 1;
    let (rows, cols) = size;
    if rows < v || cols < h {
        return; // image unmodified
    }

    let pitch = cols as isize;
    let offsets = median_offsets(pitch, kernel_indices);
    let mut points = vec![0.0f32; offsets.len()];

    let num_rows = rows - v + 1;
    let num_cols = cols - h + 1;
    let mut idx_start = (v / 2) * cols + h / 2;

    for _ in 0..num_rows {
        let mut idx = idx_start;
        for _ in 0..num_cols {
            for (point, &offset) in points.iter_mut().zip(offsets.iter()) {
                *point = input[(idx as isize + offset) as usize];
            }
            points.sort_by(|a, b| a.partial_cmp(b).unwrap());
            out[idx] = points[points.len() / 2];
            idx += 1;
        }
        idx_start += cols;
    }
}

/// 1-D median over a stripe of ranges, window length chosen by binning.
pub fn median1d(range: &[f32], out: &mut [f32], binning: usize) {
    out.copy_from_slice(range);
    const LENGTH_BY_BINNING: [usize; 5] = [5, 5, 5, 3, 3];
    let window = LENGTH_BY_BINNING[binning.min(4)];
    let half = window / 2;
    if range.len() < window + 1 {
        return;
    }

    let mut points = vec![0.0f32; window];
    for idx in half..range.len() - half - 1 {
        for (p, v) in points.iter_mut().zip(range[idx - half..idx + half + 1].iter()) {
            *p = *v;
        }
        points.sort_by(|a, b| a.partial_cmp(b).unwrap());
        out[idx] = points[half];
    }
}

/// Collapse a raw ROI vertically with a weight window, then bin the
/// resulting single row horizontally. `weights` is either one weight per
/// input row (rect/gaussian) or a full ROI-sized per-sample weight image
/// (snr-weighted). Rows below `row_offset` are skipped.
pub fn collapse_raw_roi(
    raw_roi: &[f32],
    collapsed: &mut [f32],
    weights: &[f32],
    bin_x: usize,
    roi_size: (usize, usize),
    row_offset: usize,
) {
    let (rows, cols) = roi_size;
    let stride = cols * NUM_PHASES;
    debug_assert_eq!(collapsed.len(), NUM_PHASES * (cols / bin_x));
    debug_assert!(raw_roi.len() >= rows * stride);

    let mut summed = pool::scoped(stride);
    summed.fill(0.0);

    let per_sample = weights.len() == raw_roi.len();
    for row in row_offset..rows {
        let base = row * stride;
        for col in 0..stride {
            let idx = base + col;
            let w = if per_sample { weights[idx] } else { weights[row] };
            summed[col] += raw_roi[idx] * w;
        }
    }

    crate::binning::bin_1xn(&summed, collapsed, cols, bin_x);
}

/// Per-sample SNR weights for the stripe collapse: sqrt snr of both
/// frequencies summed, normalized per column to a peak of one. Returns
/// the effective number of summed values for the ROI height.
pub fn compute_snr_weights(
    roi0: &[f32],
    roi1: &[f32],
    weights: &mut [f32],
    roi_size: (usize, usize),
    row_offset: usize,
) -> f32 {
    let (rows, cols) = roi_size;
    debug_assert_eq!(roi0.len(), roi1.len());
    debug_assert_eq!(weights.len(), roi0.len());

    let number_of_sums = if rows == GAUSSIAN6.len() {
        GAUSSIAN6_SUMS
    } else {
        GAUSSIAN8_SUMS
    };

    for idx in 0..rows * cols {
        let snr = snr_squared(roi0, idx + row_offset * cols).sqrt()
            + snr_squared(roi1, idx + row_offset * cols).sqrt();
        let p = idx * NUM_PHASES;
        weights[p] = snr;
        weights[p + 1] = snr;
        weights[p + 2] = snr;
    }

    let stride = cols * NUM_PHASES;
    for col in (0..stride).step_by(NUM_PHASES) {
        let mut column_max = 0.0f32;
        for row in row_offset..rows {
            column_max = column_max.max(weights[col + row * stride]);
        }
        if column_max == 0.0 {
            continue;
        }
        for row in row_offset..rows {
            let w = weights[col + row * stride] / column_max;
            weights[col + row * stride] = w;
            weights[col + 1 + row * stride] = w;
            weights[col + 2 + row * stride] = w;
        }
    }

    number_of_sums
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh2f_shift_recovery() {
        let words: Vec<u16> = vec![0x1230, 0x0450, 0xfff0];
        let mut bytes = Vec::new();
        for w in &words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let mut dst = vec![0.0f32; 3];
        sh2f(&bytes, &mut dst, 1, 0xfff0);
        // Inverse scaling recovers the masked input up to the shift.
        for (w, d) in words.iter().zip(dst.iter()) {
            assert_eq!((*d as u32) << 1, u32::from(w & 0xfff0));
        }
    }

    #[test]
    fn test_tap_rotation_fixed_point() {
        // All three permutations equal {A=10, B=20, C=30}: every output
        // component sums to 60.
        let (rows, cols) = (1, 4);
        let plane = rows * cols * NUM_PHASES;
        let mut roi = vec![0.0f32; plane * 6];
        for p in 0..6 {
            for idx in 0..rows * cols {
                roi[p * plane + 3 * idx] = 10.0;
                roi[p * plane + 3 * idx + 1] = 20.0;
                roi[p * plane + 3 * idx + 2] = 30.0;
            }
        }
        let mut frame = vec![0.0f32; plane];
        tap_rotation(&roi, &mut frame, 0, (rows, cols), true);
        assert!(frame.iter().all(|&v| v == 60.0));
        tap_rotation(&roi, &mut frame, 1, (rows, cols), true);
        assert!(frame.iter().all(|&v| v == 60.0));
    }

    #[test]
    fn test_tap_rotation_hardware_passthrough() {
        // Hardware-reduced input has one permutation; rotation is a copy.
        let (rows, cols) = (2, 3);
        let plane = rows * cols * NUM_PHASES;
        let roi: Vec<f32> = (0..plane * 2).map(|i| i as f32).collect();
        let mut frame = vec![0.0f32; plane];
        tap_rotation(&roi, &mut frame, 0, (rows, cols), false);
        assert_eq!(&frame[..], &roi[..plane]);
        tap_rotation(&roi, &mut frame, 1, (rows, cols), false);
        assert_eq!(&frame[..], &roi[plane..]);
    }

    #[test]
    fn test_snr_vote_keeps_best() {
        let strong = vec![100.0, 80.0, 1.0];
        let weak = vec![10.0, 8.0, 1.0];
        let mut fov0 = vec![0.0; 3];
        let mut fov1 = vec![0.0; 3];
        let mut snr = vec![0.0; 1];

        snr_vote(&weak, &weak, &mut fov0, &mut fov1, &mut snr, 0);
        assert_eq!(fov0, weak);
        let weak_snr = snr[0];

        snr_vote(&strong, &strong, &mut fov0, &mut fov1, &mut snr, 0);
        assert_eq!(fov0, strong);
        assert!(snr[0] > weak_snr);

        // The weak triple never displaces the stored strong one.
        snr_vote(&weak, &weak, &mut fov0, &mut fov1, &mut snr, 0);
        assert_eq!(fov0, strong);
    }

    #[test]
    fn test_fill_missing_rows() {
        let (rows, cols) = (5, 2);
        let stride = cols * NUM_PHASES;
        let mut frame = vec![0.0f32; rows * stride];
        for col in 0..stride {
            frame[col] = 2.0; // row 0
            frame[2 * stride + col] = 6.0; // row 2
        }
        let active = vec![true, false, true, false, false];
        let mut out = vec![0.0f32; frame.len()];
        fill_missing_rows(&frame, &mut out, (rows, cols), &active);

        // Row 1 sits between two active rows: averaged.
        assert_eq!(out[stride], 4.0);
        // Row 3 only has an active row above: replicated.
        assert_eq!(out[3 * stride], 6.0);
        // Row 4 is the bottom border: copied through (zero).
        assert_eq!(out[4 * stride], 0.0);
    }

    #[test]
    fn test_calculate_phase_zero_signal() {
        // A == B == C gives zero signal; everything collapses to zero.
        let raw = vec![5.0, 5.0, 5.0];
        let mut phase = vec![9.0f32];
        let mut signal = vec![0.0f32];
        let mut snr = vec![0.0f32];
        let mut background = vec![0.0f32];
        calculate_phase(&raw, &mut phase, &mut signal, &mut snr, &mut background, 1.0);
        assert_eq!(phase[0], 0.0);
        assert_eq!(signal[0], 0.0);
        assert_eq!(snr[0], 0.0);
        assert_eq!(background[0], 0.0);
    }

    #[test]
    fn test_calculate_phase_c_minimum() {
        // C already the minimum: no rotation, zero fractional offset.
        let raw = vec![100.0, 60.0, 20.0];
        let mut phase = vec![0.0f32];
        let mut signal = vec![0.0f32];
        let mut snr = vec![0.0f32];
        let mut background = vec![0.0f32];
        calculate_phase(&raw, &mut phase, &mut signal, &mut snr, &mut background, 1.0);
        let sig = 100.0 + 60.0 - 40.0;
        assert_eq!(signal[0], sig);
        assert!((phase[0] - (60.0 - 20.0) / (3.0 * sig)).abs() < 1e-6);
        assert!((snr[0] - sig / 40.0f32.sqrt()).abs() < 1e-4);
        assert_eq!(background[0], 20.0);
    }

    #[test]
    fn test_phase_correction_full_cycle() {
        // Raw phase a full cycle above the smoothed phase corrects down.
        let smoothed_raw = vec![100.0, 60.0, 20.0];
        let mut phase_smoothed = vec![0.0f32];
        let phase = vec![0.95f32];
        let mut corrected = vec![0.0f32];
        calculate_phase_smooth(&smoothed_raw, &mut phase_smoothed, &phase, &mut corrected);
        assert!(corrected[0] < phase[0]);
        assert!((corrected[0] - (0.95 - 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_compute_range_in_bounds() {
        let f0 = crate::metadata::modulation_frequency(7);
        let f1 = crate::metadata::modulation_frequency(8);
        let g = crate::metadata::gcf(7, 8) as f32;
        let fs_int = [(f0 / g).round(), (f1 / g).round()];
        let mur = 0.5 * C_MPS / g;

        let phases0: Vec<f32> = (0..32).map(|i| i as f32 / 32.0).collect();
        let phases1: Vec<f32> = (0..32).map(|i| (i as f32 / 32.0 * 0.9) % 1.0).collect();
        let mut ranges = vec![0.0f32; 32];
        let mut m_frame = vec![0.0f32; 32];
        compute_range(
            &phases0,
            &phases1,
            &phases0,
            &phases1,
            &mut ranges,
            [f0, f1],
            fs_int,
            &mut m_frame,
        );
        for &r in &ranges {
            assert!(r >= 0.0);
            assert!(r < 2.0 * mur); // pre-modulo value is bounded
        }
    }

    #[test]
    fn test_smooth_identity_kernel() {
        let raw: Vec<f32> = (0..8 * 8 * 3).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; raw.len()];
        smooth_summed(&raw, &mut out, (8, 8), 0, 0);
        assert_eq!(raw, out);
    }

    #[test]
    fn test_smooth_preserves_flat_field() {
        // A constant field stays constant in the interior under any
        // normalized kernel.
        let raw = vec![10.0f32; 16 * 16 * 3];
        let mut out = vec![0.0f32; raw.len()];
        smooth_summed(&raw, &mut out, (16, 16), 2, 3);
        for &v in &out {
            assert!((v - 10.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_min_max_marks_transition() {
        let (rows, cols) = (7, 7);
        let mut m = vec![0.0f32; rows * cols];
        // A step of 3 cycles through the middle row.
        for r in 4..rows {
            for c in 0..cols {
                m[r * cols + c] = 3.0;
            }
        }
        let mut mask = vec![0.0f32; m.len()];
        min_max_recursive(&m, &mut mask, Some((3, 3)), (rows, cols), 1.0);
        // Some pixel at the step survives both passes; everything away
        // from it stays clean.
        assert!(mask.iter().any(|&v| v > 0.0));
        for row in [0usize, 1, 6] {
            for col in 0..cols {
                assert_eq!(mask[row * cols + col], 0.0, "row {row} col {col}");
            }
        }
    }

    #[test]
    fn test_min_max_disabled() {
        let m = vec![0.0f32; 25];
        let mut mask = vec![1.0f32; 25];
        min_max_recursive(&m, &mut mask, None, (5, 5), 1.0);
        assert!(mask.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_median_plus_removes_spike() {
        let (rows, cols) = (9, 9);
        let mut input = vec![1.0f32; rows * cols];
        input[4 * cols + 4] = 100.0;
        let mut out = vec![0.0f32; input.len()];
        median_filter_plus(&input, &mut out, (2, 3), (rows, cols), true);
        assert_eq!(out[4 * cols + 4], 1.0);
    }

    #[test]
    fn test_median_plus_disabled_passthrough() {
        let input: Vec<f32> = (0..81).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; input.len()];
        median_filter_plus(&input, &mut out, (2, 3), (9, 9), false);
        assert_eq!(input, out);
    }

    #[test]
    fn test_median1d_smooths_spike() {
        let mut range = vec![2.0f32; 32];
        range[10] = 50.0;
        let mut out = vec![0.0f32; 32];
        median1d(&range, &mut out, 1);
        assert_eq!(out[10], 2.0);
    }

    #[test]
    fn test_collapse_rect_window() {
        let (rows, cols) = (6, 4);
        let raw = vec![2.0f32; rows * cols * NUM_PHASES];
        let mut collapsed = vec![0.0f32; cols * NUM_PHASES];
        collapse_raw_roi(&raw, &mut collapsed, &RECT6, 1, (rows, cols), 0);
        // Six rows of 2.0 with unit weights.
        assert!(collapsed.iter().all(|&v| (v - 12.0).abs() < 1e-6));
    }

    #[test]
    fn test_snr_weights_peak_one() {
        let (rows, cols) = (6, 4);
        let mut roi = vec![0.0f32; rows * cols * NUM_PHASES];
        for idx in 0..rows * cols {
            roi[3 * idx] = 50.0 + idx as f32;
            roi[3 * idx + 1] = 30.0;
            roi[3 * idx + 2] = 5.0;
        }
        let mut weights = vec![0.0f32; roi.len()];
        let sums = compute_snr_weights(&roi, &roi, &mut weights, (rows, cols), 0);
        assert_eq!(sums, GAUSSIAN6_SUMS);
        let stride = cols * NUM_PHASES;
        for col in (0..stride).step_by(NUM_PHASES) {
            let max = (0..rows)
                .map(|r| weights[col + r * stride])
                .fold(0.0f32, f32::max);
            assert!((max - 1.0).abs() < 1e-6);
        }
    }
}
