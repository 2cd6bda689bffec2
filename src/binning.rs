// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Binning of raw pixel triplets, 2-D for grid mode and 1-D for stripe
//! mode. Supported factors are 1, 2, and 4, identical in both dimensions;
//! binning sums neighborhoods, it does not average.

use crate::metadata::NUM_PHASES;
use crate::pool;
use tracing::error;

/// 2-D binning dispatch. Odd-height frames clip the bottom rows that do
/// not fill a neighborhood.
pub fn bin_mxn(frame: &[f32], binned: &mut [f32], size: (usize, usize), binning: usize) {
    match binning {
        1 => bin_1x1(frame, binned),
        2 => bin_2x2(frame, binned, size),
        4 => bin_4x4(frame, binned, size),
        other => error!(binning = other, "only binning of 1, 2, or 4 is allowed"),
    }
}

fn bin_1x1(frame: &[f32], binned: &mut [f32]) {
    binned.copy_from_slice(&frame[..binned.len()]);
}

fn bin_2x2(frame: &[f32], binned: &mut [f32], size: (usize, usize)) {
    let (rows, cols) = size;
    let (out_rows, out_cols) = (rows / 2, cols / 2);
    debug_assert!(frame.len() >= NUM_PHASES * out_rows * out_cols * 4);
    debug_assert_eq!(binned.len(), NUM_PHASES * out_rows * out_cols);

    let stride = cols * NUM_PHASES;
    for row in 0..out_rows {
        let top = 2 * row * stride;
        let bottom = top + stride;
        let out_base = row * out_cols * NUM_PHASES;
        for col in 0..out_cols {
            let i = 2 * col * NUM_PHASES;
            let o = out_base + col * NUM_PHASES;
            for comp in 0..NUM_PHASES {
                binned[o + comp] = frame[top + i + comp]
                    + frame[top + i + NUM_PHASES + comp]
                    + frame[bottom + i + comp]
                    + frame[bottom + i + NUM_PHASES + comp];
            }
        }
    }
}

fn bin_4x4(frame: &[f32], binned: &mut [f32], size: (usize, usize)) {
    let (rows, cols) = size;
    let mut half = pool::scoped(NUM_PHASES * (rows / 2) * (cols / 2));
    bin_2x2(frame, &mut half, size);
    bin_2x2(&half, binned, (rows / 2, cols / 2));
}

/// 1-D binning dispatch for stripe mode. `width` counts raw triplets.
pub fn bin_1xn(row: &[f32], binned: &mut [f32], width: usize, bin_x: usize) {
    match bin_x {
        0 | 1 => binned.copy_from_slice(&row[..binned.len()]),
        2 | 4 => {
            let out_width = width / bin_x;
            debug_assert_eq!(binned.len(), NUM_PHASES * out_width);
            for idx in 0..out_width {
                let o = idx * NUM_PHASES;
                let i = o * bin_x;
                for comp in 0..NUM_PHASES {
                    binned[o + comp] = (0..bin_x)
                        .map(|k| row[i + k * NUM_PHASES + comp])
                        .sum();
                }
            }
        }
        other => error!(binning = other, "only binning of 1, 2, or 4 is allowed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_1x1_bit_identical() {
        let frame: Vec<f32> = (0..4 * 4 * 3).map(|i| i as f32).collect();
        let mut binned = vec![0.0f32; frame.len()];
        bin_mxn(&frame, &mut binned, (4, 4), 1);
        assert_eq!(frame, binned);
    }

    #[test]
    fn test_bin_2x2_sums_neighborhood() {
        let (rows, cols) = (4, 4);
        let frame = vec![1.0f32; rows * cols * NUM_PHASES];
        let mut binned = vec![0.0f32; (rows / 2) * (cols / 2) * NUM_PHASES];
        bin_mxn(&frame, &mut binned, (rows, cols), 2);
        assert!(binned.iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_bin_4x4_is_two_2x2() {
        let (rows, cols) = (8, 8);
        let frame = vec![1.0f32; rows * cols * NUM_PHASES];
        let mut binned = vec![0.0f32; (rows / 4) * (cols / 4) * NUM_PHASES];
        bin_mxn(&frame, &mut binned, (rows, cols), 4);
        assert!(binned.iter().all(|&v| v == 16.0));
    }

    #[test]
    fn test_area_relationship() {
        // fov_cells * bin^2 == raw_cells for every supported factor.
        let (rows, cols) = (16, 16);
        let raw_cells = rows * cols;
        for bin in [1usize, 2, 4] {
            let fov_cells = (rows / bin) * (cols / bin);
            assert_eq!(fov_cells * bin * bin, raw_cells);
        }
    }

    #[test]
    fn test_bin_1xn() {
        let width = 8;
        let row: Vec<f32> = (0..width * NUM_PHASES).map(|i| (i / 3) as f32).collect();
        let mut binned = vec![0.0f32; (width / 2) * NUM_PHASES];
        bin_1xn(&row, &mut binned, width, 2);
        // Pairs (0,1), (2,3), ...
        assert_eq!(binned[0], 1.0);
        assert_eq!(binned[3], 5.0);
    }
}
