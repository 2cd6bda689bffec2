// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Nearest-neighbor outlier removal on the range image.
//!
//! Each range value is compared against a square neighborhood; values
//! with too few neighbors inside the range tolerance are zeroed. The
//! neighbor count includes the center pixel itself.

/// Minimum neighbors (center included) required per level.
const NEIGHBOR_COUNT_BY_LEVEL: [u16; 6] = [0, 3, 5, 5, 7, 11];
/// Window edge per level.
const WINDOW_BY_LEVEL: [usize; 6] = [0, 3, 5, 6, 7, 9];
/// Fraction of the center range accepted as tolerance per level.
const RANGE_TOLERANCE_BY_LEVEL: [f32; 6] = [
    0.0,
    1.0 / 16.0,
    1.0 / 16.0,
    1.0 / 16.0,
    1.0 / 16.0,
    1.0 / 16.0,
];

#[inline]
fn count_neighbors(
    val: f32,
    range_tol: f32,
    min_count: u16,
    ranges: &[f32],
    start: usize,
    window: usize,
    stride: usize,
) -> f32 {
    let mut count = 0u16;
    let mut row_start = start;
    for _ in 0..window {
        for &win_val in &ranges[row_start..row_start + window] {
            count += u16::from(range_tol >= (win_val - val).abs());
        }
        row_start += stride;
    }
    if count < min_count {
        0.0
    } else {
        val
    }
}

/// Zero out range values that too few neighbors agree with.
///
/// Level 0 is a strict identity; levels above 5 clamp to 5. Frames too
/// small for the largest window pass through untouched.
pub fn remove_outliers(ranges: &mut [f32], level: u16, size: (usize, usize)) {
    if level == 0 {
        return;
    }
    let level = level.min(5) as usize;

    let (rows, cols) = size;
    let largest = *NEIGHBOR_COUNT_BY_LEVEL.last().unwrap() as usize;
    if rows < largest || cols < largest {
        return;
    }

    let window = WINDOW_BY_LEVEL[level];
    let half = window / 2;
    let tol_frac = RANGE_TOLERANCE_BY_LEVEL[level];
    let min_count = NEIGHBOR_COUNT_BY_LEVEL[level];

    let snapshot = ranges.to_vec();

    let stride = cols;
    let mut col_start = half + stride * half;
    let mut win_start = 0;

    for _ in 0..rows - 2 * half {
        let mut pix = col_start;
        let mut win = win_start;
        for _ in 0..cols - 2 * half {
            let val = snapshot[pix];
            let range_tol = 1.0 / 1024.0 + val * tol_frac;
            ranges[pix] = count_neighbors(
                val, range_tol, min_count, &snapshot, win, window, stride,
            );
            pix += 1;
            win += 1;
        }
        win_start += stride;
        col_start += stride;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_zero_is_identity() {
        let mut ranges: Vec<f32> = (0..15 * 15).map(|i| (i % 7) as f32).collect();
        let before = ranges.clone();
        remove_outliers(&mut ranges, 0, (15, 15));
        assert_eq!(ranges, before);
    }

    #[test]
    fn test_lonely_outlier_removed() {
        let (rows, cols) = (15, 15);
        let mut ranges = vec![5.0f32; rows * cols];
        ranges[7 * cols + 7] = 50.0;
        remove_outliers(&mut ranges, 1, (rows, cols));
        assert_eq!(ranges[7 * cols + 7], 0.0);
        // Agreeing neighborhood survives.
        assert_eq!(ranges[7 * cols + 5], 5.0);
    }

    #[test]
    fn test_small_frame_untouched() {
        let mut ranges = vec![1.0f32, 99.0, 1.0, 1.0];
        let before = ranges.clone();
        remove_outliers(&mut ranges, 3, (2, 2));
        assert_eq!(ranges, before);
    }

    #[test]
    fn test_level_clamps_to_five() {
        let (rows, cols) = (15, 15);
        let mut a = vec![5.0f32; rows * cols];
        let mut b = a.clone();
        a[7 * cols + 7] = 50.0;
        b[7 * cols + 7] = 50.0;
        remove_outliers(&mut a, 5, (rows, cols));
        remove_outliers(&mut b, 9, (rows, cols));
        assert_eq!(a, b);
    }
}
