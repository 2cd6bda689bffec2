// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Metadata row decoder for the iTOF sensor head.
//!
//! Every ROI delivered by the capture device carries one full video line
//! (640 x 3 little-endian `u16` words) of metadata ahead of the raw
//! payload. Each metadata value is a 12-bit quantity left-shifted by four
//! bits inside its 16-bit slot. [`Metadata`] borrows the ROI bytes and
//! exposes typed accessors; nothing is copied.

use std::fmt;
use tracing::error;

/// Fixed sensor width in pixels. ROI width never varies.
pub const IMAGE_WIDTH: usize = 640;
/// Unbinned sensor height.
pub const MAX_IMAGE_HEIGHT: usize = 480;
/// Tallest supported steady-state ROI.
pub const MAX_ROI_HEIGHT: usize = 20;
/// iTOF phase components per raw pixel (A, B, C).
pub const NUM_PHASES: usize = 3;
/// Tap-rotation permutations when the engine performs the summation.
pub const NUM_PERMUTATIONS: usize = 3;
/// Modulation frequencies per ROI. Only dual-frequency mode is supported.
pub const NUM_FREQUENCIES: usize = 2;

/// Number of `u16` words in the metadata row.
pub const MD_ROW_SHORTS: usize = IMAGE_WIDTH * NUM_PHASES;
/// Number of bytes in the metadata row.
pub const MD_ROW_BYTES: usize = MD_ROW_SHORTS * 2;
/// Words actually defined by the layout (fixed section + 8 per-FOV blocks).
pub const MD_STRUCT_SHORTS: usize = PER_FOV_OFFSET + MAX_ACTIVE_FOVS * PER_FOV_STRIDE;
/// Bytes covered by the defined layout; the minimum buffer a decoder accepts.
pub const MD_STRUCT_BYTES: usize = MD_STRUCT_SHORTS * 2;

/// Maximum number of simultaneously reconstructed FOVs.
pub const MAX_ACTIVE_FOVS: usize = 8;

/// Mask selecting the live bits of a raw pixel word.
pub const RAW_PIXEL_MASK: u16 = 0xfffc;
/// All raw input is right-shifted by this on ingest.
pub const INPUT_RAW_SHIFT: u32 = 1;
/// The FPGA scales raw data by this before transmission.
pub const FPGA_DATA_SCALE: u32 = 2;

pub const C_MPS: f32 = 299_792_498.0;
/// Fraction of the max unambiguous range used as the optional range limit.
pub const RANGE_LIMIT_FRACTION: f32 = 0.8;
/// Output ranges are quantized to 1/1024 m per count on the wire.
pub const RANGE_NETWORK_SCALE: f32 = 1024.0;

/// Saturation threshold value that disables HDR entirely.
pub const SATURATION_THRESHOLD_DISABLED: u16 = 4095;
/// Highest nearest-neighbor filter level.
pub const MAX_NEAREST_NEIGHBOR_LEVEL: u16 = 5;

/// A raw ROI on the wire: metadata row plus two frequencies of a
/// max-height strip, 16-bit pixels.
pub const ROI_SIZE: usize =
    2 * (MD_ROW_SHORTS + NUM_PHASES * NUM_FREQUENCIES * MAX_ROI_HEIGHT * IMAGE_WIDTH);

const MD_SHIFT: u32 = 4;
const MD_BITS: u32 = 12;

// Word indices into the metadata row.
const W_SENSOR_MODE: usize = 0;
const W_ROI_START_ROW: usize = 1;
const W_ROI_NUM_ROWS: usize = 2;
const W_F0_MOD_IDX: usize = 3;
const W_F1_MOD_IDX: usize = 4;
const W_ROI_ID: usize = 9;
const W_ACTIVE_STREAM_BITMASK: usize = 14;
const W_START_STOP_FLAGS: usize = 15; // 8 consecutive words
const W_ROI_COUNTER: usize = 23;
const W_TIMESTAMP0: usize = 24; // 7 consecutive words
const W_ADC: usize = 31; // 9 consecutive words
const W_DISABLE_STREAMING: usize = 48;
const W_REDUCE_MODE: usize = 49;
const W_SENSOR_ID: usize = 50;
const W_SATURATION_THRESHOLD: usize = 54;
const W_SYSTEM_TYPE: usize = 55;
const W_RX_PCB_TYPE: usize = 56;
const W_TX_PCB_TYPE: usize = 57;
const W_LCM_TYPE: usize = 58;
const W_RANGE_CAL: usize = 59; // two banks of six words
const W_ADC_CAL_GAIN: usize = 71;
const W_ADC_CAL_OFFSET: usize = 72;
const W_SCAN_TABLE_TAG: usize = 73;

const PER_FOV_OFFSET: usize = 200;
const PER_FOV_STRIDE: usize = 32;
const F_USER_TAG: usize = 0;
const F_BIN_MODE: usize = 1;
const F_NEAREST_NEIGHBOR: usize = 2;
const F_FOV_ROW_START: usize = 3;
const F_FOV_NUM_ROWS: usize = 4;
const F_FOV_NUM_ROIS: usize = 5;
const F_ALG_COMMON: usize = 6;
const F_SNR_THRESH: usize = 7;
const F_RANDOM_FOV_TAG: usize = 10;
const F_ALG_GRID: usize = 11;
const F_ALG_STRIPE: usize = 12;

// sensorMode values and flags.
const SENSOR_MODE_MASK: u16 = 0x07;
pub const SENSOR_MODE_DMFD: u16 = 0x000;
pub const SENSOR_MODE_SMFD: u16 = 0x001;
pub const SENSOR_MODE_IMAGE: u16 = 0x002;
const SENSOR_MODE_HDR_RETRY: u16 = 1 << 4;

const START_STOP_FIRST_ROI: u16 = 0x01;
const START_STOP_FRAME_COMPLETED: u16 = 0x02;
const START_STOP_DUMP_RAW_ROI: u16 = 0xffc;

const DISABLE_STREAMING_MASK: u16 = 0x001;

// Algorithm bits common to grid and stripe mode.
const ALG_COMMON_STRIPE_MODE: u16 = 1 << 0;
const ALG_COMMON_DISABLE_RANGE_MASKING: u16 = 1 << 1;
const ALG_COMMON_ENABLE_MAX_RANGE_LIMIT: u16 = 1 << 2;
const ALG_COMMON_ENABLE_TEMP_RANGE_ADJ: u16 = 1 << 3;
const ALG_COMMON_DISABLE_RTD: u16 = 1 << 11;

// Grid-mode algorithm bits.
const ALG_GRID_DISABLE_CONVOLUTION: u16 = 1 << 0;
const ALG_GRID_ENABLE_RANGE_MEDIAN: u16 = 1 << 1;
const ALG_GRID_ENABLE_MIN_MAX: u16 = 1 << 2;

// Stripe-mode algorithm bits.
const ALG_STRIPE_SNR_WEIGHTED_SUM: u16 = 1 << 0;
const ALG_STRIPE_RECT_SUM: u16 = 1 << 1;
const ALG_STRIPE_GAUSSIAN_SUM: u16 = 1 << 2;
const ALG_STRIPE_ENABLE_RANGE_MEDIAN: u16 = 1 << 3;

const SYSTEM_TYPE_UNSPECIFIED: u16 = 0;
const SYSTEM_TYPE_M20: u16 = 1;
const SYSTEM_TYPE_M25: u16 = 2;
const SYSTEM_TYPE_M30: u16 = 3;

/// Errors raised while interpreting a metadata row.
#[derive(Debug)]
pub enum MetadataError {
    /// The buffer cannot hold a complete metadata row.
    TooShort(usize),
}

impl std::error::Error for MetadataError {}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetadataError::TooShort(len) => {
                write!(f, "buffer too short for metadata: {} bytes", len)
            }
        }
    }
}

/// Borrowed view over the metadata row of a raw ROI.
#[derive(Copy, Clone)]
pub struct Metadata<'a> {
    bytes: &'a [u8],
}

impl<'a> Metadata<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Metadata<'a>, MetadataError> {
        if bytes.len() < MD_STRUCT_BYTES {
            return Err(MetadataError::TooShort(bytes.len()));
        }
        Ok(Metadata { bytes })
    }

    /// Raw 16-bit word, as transported (still left-shifted by four).
    #[inline]
    fn raw_word(&self, idx: usize) -> u16 {
        u16::from_le_bytes([self.bytes[2 * idx], self.bytes[2 * idx + 1]])
    }

    /// Decoded 12-bit metadata value.
    #[inline]
    fn word(&self, idx: usize) -> u16 {
        self.raw_word(idx) >> MD_SHIFT
    }

    #[inline]
    fn fov_word(&self, fov: usize, idx: usize) -> u16 {
        self.word(PER_FOV_OFFSET + PER_FOV_STRIDE * fov + idx)
    }

    pub fn sensor_mode(&self) -> u16 {
        self.word(W_SENSOR_MODE) & SENSOR_MODE_MASK
    }

    pub fn roi_start_row(&self) -> u16 {
        self.word(W_ROI_START_ROW)
    }

    pub fn roi_num_rows(&self) -> u16 {
        self.word(W_ROI_NUM_ROWS)
    }

    pub fn roi_num_columns() -> u16 {
        IMAGE_WIDTH as u16
    }

    pub fn roi_start_column() -> u16 {
        0
    }

    pub fn f0_modulation_index(&self) -> u16 {
        self.word(W_F0_MOD_IDX)
    }

    pub fn f1_modulation_index(&self) -> u16 {
        self.word(W_F1_MOD_IDX)
    }

    pub fn roi_id(&self) -> u16 {
        self.word(W_ROI_ID)
    }

    pub fn roi_counter(&self) -> u16 {
        self.word(W_ROI_COUNTER)
    }

    pub fn adc(&self, idx: usize) -> u16 {
        self.word(W_ADC + idx)
    }

    pub fn sensor_id(&self) -> u16 {
        self.word(W_SENSOR_ID)
    }

    pub fn scan_table_tag(&self) -> u16 {
        self.word(W_SCAN_TABLE_TAG)
    }

    pub fn system_type(&self) -> u16 {
        self.word(W_SYSTEM_TYPE)
    }

    pub fn rx_pcb_type(&self) -> u16 {
        self.word(W_RX_PCB_TYPE)
    }

    pub fn tx_pcb_type(&self) -> u16 {
        self.word(W_TX_PCB_TYPE)
    }

    pub fn lcm_type(&self) -> u16 {
        self.word(W_LCM_TYPE)
    }

    pub fn is_m20(&self) -> bool {
        matches!(
            self.system_type(),
            SYSTEM_TYPE_M20 | SYSTEM_TYPE_UNSPECIFIED
        )
    }

    pub fn is_m25(&self) -> bool {
        self.system_type() == SYSTEM_TYPE_M25
    }

    pub fn is_m30(&self) -> bool {
        self.system_type() == SYSTEM_TYPE_M30
    }

    pub fn disable_streaming(&self) -> bool {
        self.word(W_DISABLE_STREAMING) & DISABLE_STREAMING_MASK != 0
    }

    pub fn reduce_mode(&self) -> u16 {
        self.word(W_REDUCE_MODE)
    }

    /// True when the engine must perform the tap-rotation summation.
    pub fn do_tap_accumulation(&self) -> bool {
        self.reduce_mode() == 0
    }

    pub fn num_permutations(&self) -> usize {
        if self.do_tap_accumulation() {
            NUM_PERMUTATIONS
        } else {
            1
        }
    }

    pub fn num_modulation_frequencies(&self) -> usize {
        match self.sensor_mode() {
            SENSOR_MODE_IMAGE => 0,
            SENSOR_MODE_SMFD => 1,
            _ => 2,
        }
    }

    /// Number of bytes of raw payload this metadata announces (without the
    /// metadata row itself).
    pub fn roi_payload_bytes(&self) -> usize {
        2 * self.roi_num_rows() as usize
            * IMAGE_WIDTH
            * NUM_PHASES
            * self.num_modulation_frequencies()
            * self.num_permutations()
    }

    // FOV routing.

    pub fn active_fov_bitmask(&self) -> u16 {
        self.word(W_ACTIVE_STREAM_BITMASK)
    }

    pub fn is_fov_active(&self, fov: usize) -> bool {
        (self.active_fov_bitmask() >> fov) & 1 != 0
    }

    pub fn active_fovs(&self) -> Vec<usize> {
        (0..MAX_ACTIVE_FOVS)
            .filter(|&fov| self.is_fov_active(fov))
            .collect()
    }

    pub fn start_stop_flags(&self, fov: usize) -> u16 {
        self.word(W_START_STOP_FLAGS + fov)
    }

    /// First ROI of this FOV. Unconditionally true in stripe mode.
    pub fn first_roi(&self, fov: usize) -> bool {
        self.stripe_mode_enabled(fov)
            || self.start_stop_flags(fov) & START_STOP_FIRST_ROI != 0
    }

    /// Last ROI of this FOV. Unconditionally true in stripe mode.
    pub fn frame_completed(&self, fov: usize) -> bool {
        self.stripe_mode_enabled(fov)
            || self.start_stop_flags(fov) & START_STOP_FRAME_COMPLETED != 0
    }

    pub fn dump_raw_roi(&self, fov: usize) -> bool {
        self.start_stop_flags(fov) & START_STOP_DUMP_RAW_ROI != 0
    }

    // Per-FOV parameters.

    pub fn user_tag(&self, fov: usize) -> u16 {
        self.fov_word(fov, F_USER_TAG)
    }

    pub fn bin_mode(&self, fov: usize) -> u16 {
        self.fov_word(fov, F_BIN_MODE)
    }

    /// Binning factor, identical in both dimensions. 0 decodes as 1.
    pub fn binning(&self, fov: usize) -> u16 {
        match self.bin_mode(fov) {
            0 => 1,
            b => b,
        }
    }

    pub fn nearest_neighbor_level(&self, fov: usize) -> u16 {
        if self.disable_range_masking(fov) {
            return 0;
        }
        self.fov_word(fov, F_NEAREST_NEIGHBOR)
            .min(MAX_NEAREST_NEIGHBOR_LEVEL)
    }

    pub fn fov_start_row(&self, fov: usize) -> u16 {
        self.fov_word(fov, F_FOV_ROW_START)
    }

    pub fn fov_num_rows(&self, fov: usize) -> u16 {
        self.fov_word(fov, F_FOV_NUM_ROWS)
    }

    pub fn fov_num_rois(&self, fov: usize) -> u16 {
        if self.stripe_mode_enabled(fov) {
            1
        } else {
            self.fov_word(fov, F_FOV_NUM_ROIS)
        }
    }

    /// Output FOV width after binning.
    pub fn full_image_width(&self, fov: usize) -> u16 {
        IMAGE_WIDTH as u16 / self.binning(fov)
    }

    /// Output FOV height after binning.
    pub fn full_image_height(&self, fov: usize) -> u16 {
        self.fov_num_rows(fov) / self.binning(fov)
    }

    pub fn snr_thresh(&self, fov: usize) -> f32 {
        f32::from(self.fov_word(fov, F_SNR_THRESH)) / 8.0
    }

    pub fn random_fov_tag(&self, fov: usize) -> u16 {
        self.fov_word(fov, F_RANDOM_FOV_TAG)
    }

    pub fn algorithm_common(&self, fov: usize) -> u16 {
        self.fov_word(fov, F_ALG_COMMON)
    }

    pub fn algorithm_grid(&self, fov: usize) -> u16 {
        self.fov_word(fov, F_ALG_GRID)
    }

    pub fn algorithm_stripe(&self, fov: usize) -> u16 {
        self.fov_word(fov, F_ALG_STRIPE)
    }

    pub fn stripe_mode_enabled(&self, fov: usize) -> bool {
        self.algorithm_common(fov) & ALG_COMMON_STRIPE_MODE != 0
    }

    pub fn grid_mode_enabled(&self, fov: usize) -> bool {
        !self.stripe_mode_enabled(fov)
    }

    pub fn disable_range_masking(&self, fov: usize) -> bool {
        self.algorithm_common(fov) & ALG_COMMON_DISABLE_RANGE_MASKING != 0
    }

    pub fn enable_max_range_limit(&self, fov: usize) -> bool {
        self.algorithm_common(fov) & ALG_COMMON_ENABLE_MAX_RANGE_LIMIT != 0
    }

    pub fn enable_temp_range_adjustment(&self, fov: usize) -> bool {
        self.algorithm_common(fov) & ALG_COMMON_ENABLE_TEMP_RANGE_ADJ != 0
    }

    pub fn disable_rtd(&self, fov: usize) -> bool {
        self.algorithm_common(fov) & ALG_COMMON_DISABLE_RTD != 0
    }

    pub fn disable_phase_smoothing(&self, fov: usize) -> bool {
        self.algorithm_grid(fov) & ALG_GRID_DISABLE_CONVOLUTION != 0
    }

    pub fn perform_ghost_median(&self, fov: usize) -> bool {
        self.algorithm_grid(fov) & ALG_GRID_ENABLE_RANGE_MEDIAN != 0
    }

    pub fn perform_ghost_min_max(&self, fov: usize) -> bool {
        self.algorithm_grid(fov) & ALG_GRID_ENABLE_MIN_MAX != 0
    }

    pub fn stripe_snr_weighted_sum(&self, fov: usize) -> bool {
        self.algorithm_stripe(fov) & ALG_STRIPE_SNR_WEIGHTED_SUM != 0
    }

    pub fn stripe_rect_sum(&self, fov: usize) -> bool {
        self.algorithm_stripe(fov) & ALG_STRIPE_RECT_SUM != 0
    }

    pub fn stripe_gaussian_sum(&self, fov: usize) -> bool {
        self.algorithm_stripe(fov) & ALG_STRIPE_GAUSSIAN_SUM != 0
    }

    pub fn stripe_range_median(&self, fov: usize) -> bool {
        self.algorithm_stripe(fov) & ALG_STRIPE_ENABLE_RANGE_MEDIAN != 0
    }

    // HDR.

    /// This ROI is a re-acquisition of a saturated predecessor.
    pub fn was_previous_roi_saturated(&self) -> bool {
        self.word(W_SENSOR_MODE) & SENSOR_MODE_HDR_RETRY != 0
    }

    /// Saturation threshold at its maximum disables HDR.
    pub fn hdr_disabled(&self) -> bool {
        self.word(W_SATURATION_THRESHOLD) == SATURATION_THRESHOLD_DISABLED
    }

    /// Saturation threshold scaled to the domain of the raw data as
    /// received. HDR runs before tap rotation, so when the FPGA already
    /// tripled the values the threshold triples too, and the FPGA
    /// pre-scale always applies.
    pub fn saturation_threshold(&self) -> u16 {
        let mut threshold = u32::from(self.word(W_SATURATION_THRESHOLD));
        if !self.do_tap_accumulation() {
            threshold *= 3;
        }
        threshold *= FPGA_DATA_SCALE;
        threshold as u16
    }

    // Timestamps.

    /// Compact 64-bit timestamp: the five low metadata words, 12 bits each.
    pub fn timestamp(&self) -> u64 {
        (0..5).fold(0u64, |acc, i| {
            acc | (u64::from(self.word(W_TIMESTAMP0 + i)) << (MD_BITS * i as u32))
        })
    }

    /// Extended timestamp: 94 live bits split over three 32-bit words,
    /// nanoseconds in word 0, seconds spanning words 1 and 2.
    pub fn timestamps(&self) -> [u32; 3] {
        let t = |i: usize| u32::from(self.word(W_TIMESTAMP0 + i));
        let val0 = t(0) | (t(1) << 12) | ((t(2) & 0xff) << 24);
        let val1 = (t(2) >> 8) | (t(3) << 4) | (t(4) << 16) | ((t(5) & 0xf) << 28);
        let val2 = (t(5) >> 4) | (t(6) << 8);
        [val0, val1, val2]
    }

    // Temperature/range calibration coefficients. Two banks are carried,
    // one per supported frequency pair; the bank belonging to the lower
    // index pair is selected.

    fn range_cal_bank(&self) -> usize {
        let lo = self.f0_modulation_index().min(self.f1_modulation_index());
        if lo <= 7 {
            0
        } else {
            6
        }
    }

    /// Fixed range offset in millimeters, s10.5.
    pub fn range_cal_offset_mm(&self) -> f32 {
        let bank = W_RANGE_CAL + self.range_cal_bank();
        f32::from(s16(self.word(bank), self.word(bank + 1))) / 32.0
    }

    /// Range offset scale in millimeters per volt, s3.12.
    pub fn range_cal_mm_per_volt(&self) -> f32 {
        let bank = W_RANGE_CAL + self.range_cal_bank();
        f32::from(s16(self.word(bank + 2), self.word(bank + 3))) / 4096.0
    }

    /// Range offset scale in millimeters per degree Celsius, u9.7.
    pub fn range_cal_mm_per_celsius(&self) -> f32 {
        let bank = W_RANGE_CAL + self.range_cal_bank();
        let lo = self.word(bank + 4);
        let hi = self.word(bank + 5);
        f32::from((hi & 0xf) << 12 | (lo & 0xfff)) / 128.0
    }

    /// ADC calibration gain, u0.19.
    pub fn adc_cal_gain(&self) -> f32 {
        f32::from(self.word(W_ADC_CAL_GAIN)) * (-19.0f32).exp2()
    }

    /// ADC calibration offset, s0.14.
    pub fn adc_cal_offset(&self) -> f32 {
        let shifted = (self.word(W_ADC_CAL_OFFSET) << 4) as i16;
        f32::from(shifted) * (-18.0f32).exp2()
    }

    pub fn max_unambiguous_range(&self) -> f32 {
        let g = gcf(self.f0_modulation_index(), self.f1_modulation_index());
        if g == 0 {
            return 0.0;
        }
        0.5 * C_MPS / g as f32
    }
}

/// Combine two 12-bit metadata values into one signed 16-bit value.
pub fn s16(lo: u16, hi: u16) -> i16 {
    ((lo & 0xfff) | ((hi & 0xf) << 12)) as i16
}

/// Modulation frequency in Hz for an index, zero outside {3..10}.
pub fn modulation_frequency(idx: u16) -> f32 {
    if (3..=10).contains(&idx) {
        1.0e9 / (3.0 * f32::from(idx))
    } else {
        0.0
    }
}

/// Greatest common frequency of an adjacent modulation index pair, in Hz.
///
/// Any pair that is not adjacent within {3..10} yields 0 and one logged
/// error.
pub fn gcf(f0_idx: u16, f1_idx: u16) -> u32 {
    if modulation_frequency(f0_idx) == 0.0 || modulation_frequency(f1_idx) == 0.0 {
        error!(f0_idx, f1_idx, "undefined modulation frequency index");
        return 0;
    }
    if f0_idx.abs_diff(f1_idx) != 1 {
        error!(
            f0_idx,
            f1_idx, "unsupported modulation index combination, indices must be adjacent"
        );
        return 0;
    }
    let n0 = u32::from(f0_idx.min(f1_idx));
    let n1 = u32::from(f0_idx.max(f1_idx));
    (1.0e9 / (3.0 * (n0 * n1) as f32)).round() as u32
}

/// Add a whole-second UTC offset to the FPGA timestamp in place.
///
/// Only the four-and-a-bit seconds words are rewritten; a zero offset
/// leaves the buffer bitwise unchanged. Seconds bit layout: s0..s3 ride in
/// the top nibble of word 26, then 12 bits each in words 27..30.
pub fn adjust_timestamp(md: &mut [u8], offset_secs: u64) {
    if offset_secs == 0 {
        return;
    }
    debug_assert!(md.len() >= 2 * (W_TIMESTAMP0 + 7));

    fn rd(md: &[u8], i: usize) -> u64 {
        u64::from(u16::from_le_bytes([md[2 * i], md[2 * i + 1]]))
    }
    fn wr(md: &mut [u8], i: usize, v: u16) {
        let b = v.to_le_bytes();
        md[2 * i] = b[0];
        md[2 * i + 1] = b[1];
    }

    let t2 = W_TIMESTAMP0 + 2;
    let mut secs = (rd(md, t2) >> 12)
        | (rd(md, t2 + 1) & 0xfff0)
        | ((rd(md, t2 + 2) & 0xfff0) << 12)
        | ((rd(md, t2 + 3) & 0xfff0) << 24)
        | ((rd(md, t2 + 4) & 0xfff0) << 36);

    secs = secs.wrapping_add(offset_secs);

    let old_t2 = rd(md, t2) as u16;
    wr(md, t2, (old_t2 & 0x0ff0) | (((secs & 0xf) << 12) as u16));
    wr(md, t2 + 1, (secs & 0x0000_0000_0000_fff0) as u16);
    wr(md, t2 + 2, ((secs & 0x0000_0000_0fff_0000) >> 12) as u16);
    wr(md, t2 + 3, ((secs & 0x0000_00ff_f000_0000) >> 24) as u16);
    wr(md, t2 + 4, ((secs & 0x000f_ff00_0000_0000) >> 36) as u16);
}

/// A complete, internally consistent metadata row: full-frame grid FOV 0,
/// modulation pair (7, 8), HDR disabled, engine-side tap rotation. Used by
/// the mock tooling and throughout the test suites as a starting point.
pub fn default_metadata_words() -> Vec<u16> {
    let mut words = vec![0u16; MD_ROW_SHORTS];
    let mut set = |idx: usize, val: u16| words[idx] = val << MD_SHIFT;

    set(W_SENSOR_MODE, SENSOR_MODE_DMFD);
    set(W_ROI_START_ROW, 0);
    set(W_ROI_NUM_ROWS, 480);
    set(W_F0_MOD_IDX, 7);
    set(W_F1_MOD_IDX, 8);
    set(W_ROI_ID, 89);
    set(W_ACTIVE_STREAM_BITMASK, 0x1);
    set(W_START_STOP_FLAGS, 0x3); // first and last ROI of FOV 0
    set(W_ROI_COUNTER, 0);
    for (i, t) in [0x12u16, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde]
        .iter()
        .enumerate()
    {
        set(W_TIMESTAMP0 + i, *t);
    }
    set(W_SENSOR_ID, 1792);
    set(W_SATURATION_THRESHOLD, SATURATION_THRESHOLD_DISABLED);
    set(W_SYSTEM_TYPE, SYSTEM_TYPE_M30);
    // Plausible range-calibration coefficients for both banks.
    set(W_RANGE_CAL, 3915);
    set(W_RANGE_CAL + 1, 15);
    set(W_RANGE_CAL + 2, 212);
    set(W_RANGE_CAL + 4, 500);
    set(W_RANGE_CAL + 6, 486);
    set(W_RANGE_CAL + 8, 557);
    set(W_RANGE_CAL + 10, 86);
    set(W_ADC_CAL_GAIN, 402);
    set(W_ADC_CAL_OFFSET, 845);
    set(W_SCAN_TABLE_TAG, 0);

    for fov in 0..MAX_ACTIVE_FOVS {
        let base = PER_FOV_OFFSET + PER_FOV_STRIDE * fov;
        words[base + F_USER_TAG] = 0x0bf << MD_SHIFT;
        words[base + F_BIN_MODE] = 1 << MD_SHIFT;
        words[base + F_NEAREST_NEIGHBOR] = 1 << MD_SHIFT;
        words[base + F_FOV_ROW_START] = 0;
        words[base + F_FOV_NUM_ROWS] = 480 << MD_SHIFT;
        words[base + F_FOV_NUM_ROIS] = 1 << MD_SHIFT;
        words[base + F_ALG_COMMON] = 0;
        words[base + F_SNR_THRESH] = 0;
        words[base + F_RANDOM_FOV_TAG] = 0;
        words[base + F_ALG_GRID] = 0;
        words[base + F_ALG_STRIPE] = 0;
    }

    words
}

/// Helpers for building metadata rows word-by-word, shared by the mock
/// tooling and tests. Values are stored pre-shifted like the wire format.
pub mod build {
    use super::*;

    pub fn set(words: &mut [u16], idx: usize, val: u16) {
        words[idx] = val << MD_SHIFT;
    }

    pub fn set_fov(words: &mut [u16], fov: usize, idx: usize, val: u16) {
        words[PER_FOV_OFFSET + PER_FOV_STRIDE * fov + idx] = val << MD_SHIFT;
    }

    pub fn to_bytes(words: &[u16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(words.len() * 2);
        for w in words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub const SENSOR_MODE: usize = W_SENSOR_MODE;
    pub const ROI_START_ROW: usize = W_ROI_START_ROW;
    pub const ROI_NUM_ROWS: usize = W_ROI_NUM_ROWS;
    pub const F0_MOD_IDX: usize = W_F0_MOD_IDX;
    pub const F1_MOD_IDX: usize = W_F1_MOD_IDX;
    pub const ACTIVE_STREAM_BITMASK: usize = W_ACTIVE_STREAM_BITMASK;
    pub const START_STOP_FLAGS: usize = W_START_STOP_FLAGS;
    pub const ROI_COUNTER: usize = W_ROI_COUNTER;
    pub const TIMESTAMP0: usize = W_TIMESTAMP0;
    pub const ADC: usize = W_ADC;
    pub const REDUCE_MODE: usize = W_REDUCE_MODE;
    pub const SATURATION_THRESHOLD: usize = W_SATURATION_THRESHOLD;
    pub const SYSTEM_TYPE: usize = W_SYSTEM_TYPE;
    pub const SCAN_TABLE_TAG: usize = W_SCAN_TABLE_TAG;
    pub const FOV_USER_TAG: usize = F_USER_TAG;
    pub const FOV_BIN_MODE: usize = F_BIN_MODE;
    pub const FOV_NEAREST_NEIGHBOR: usize = F_NEAREST_NEIGHBOR;
    pub const FOV_ROW_START: usize = F_FOV_ROW_START;
    pub const FOV_NUM_ROWS: usize = F_FOV_NUM_ROWS;
    pub const FOV_NUM_ROIS: usize = F_FOV_NUM_ROIS;
    pub const FOV_ALG_COMMON: usize = F_ALG_COMMON;
    pub const FOV_SNR_THRESH: usize = F_SNR_THRESH;
    pub const FOV_RANDOM_TAG: usize = F_RANDOM_FOV_TAG;
    pub const FOV_ALG_GRID: usize = F_ALG_GRID;
    pub const FOV_ALG_STRIPE: usize = F_ALG_STRIPE;

    pub const ALG_COMMON_STRIPE: u16 = ALG_COMMON_STRIPE_MODE;
    pub const ALG_COMMON_NO_MASKING: u16 = ALG_COMMON_DISABLE_RANGE_MASKING;
    pub const ALG_COMMON_RANGE_LIMIT: u16 = ALG_COMMON_ENABLE_MAX_RANGE_LIMIT;
    pub const ALG_COMMON_TEMP_ADJ: u16 = ALG_COMMON_ENABLE_TEMP_RANGE_ADJ;
    pub const ALG_COMMON_NO_RTD: u16 = ALG_COMMON_DISABLE_RTD;
    pub const ALG_GRID_NO_SMOOTHING: u16 = ALG_GRID_DISABLE_CONVOLUTION;
    pub const ALG_GRID_MEDIAN: u16 = ALG_GRID_ENABLE_RANGE_MEDIAN;
    pub const ALG_GRID_MIN_MAX: u16 = ALG_GRID_ENABLE_MIN_MAX;
    pub const ALG_STRIPE_SNR: u16 = ALG_STRIPE_SNR_WEIGHTED_SUM;
    pub const ALG_STRIPE_RECT: u16 = ALG_STRIPE_RECT_SUM;
    pub const ALG_STRIPE_GAUSSIAN: u16 = ALG_STRIPE_GAUSSIAN_SUM;
    pub const ALG_STRIPE_MEDIAN: u16 = ALG_STRIPE_ENABLE_RANGE_MEDIAN;
    pub const MODE_HDR_RETRY: u16 = SENSOR_MODE_HDR_RETRY;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md_bytes() -> Vec<u8> {
        build::to_bytes(&default_metadata_words())
    }

    #[test]
    fn test_default_metadata_decodes() {
        let bytes = md_bytes();
        let md = Metadata::new(&bytes).unwrap();
        assert_eq!(md.sensor_mode(), SENSOR_MODE_DMFD);
        assert_eq!(md.roi_num_rows(), 480);
        assert_eq!(md.f0_modulation_index(), 7);
        assert_eq!(md.f1_modulation_index(), 8);
        assert!(md.is_fov_active(0));
        assert!(!md.is_fov_active(1));
        assert_eq!(md.active_fovs(), vec![0]);
        assert!(md.first_roi(0));
        assert!(md.frame_completed(0));
        assert!(md.hdr_disabled());
        assert!(!md.was_previous_roi_saturated());
        assert_eq!(md.binning(0), 1);
        assert_eq!(md.full_image_width(0), 640);
        assert_eq!(md.full_image_height(0), 480);
        assert_eq!(md.fov_num_rois(0), 1);
        assert!(md.do_tap_accumulation());
        assert_eq!(md.num_permutations(), 3);
    }

    #[test]
    fn test_metadata_too_short() {
        let bytes = vec![0u8; 100];
        assert!(Metadata::new(&bytes).is_err());
    }

    #[test]
    fn test_gcf_adjacent_pairs() {
        assert_eq!(gcf(7, 8), (1.0e9f32 / (3.0 * 56.0)).round() as u32);
        assert_eq!(gcf(8, 9), (1.0e9f32 / (3.0 * 72.0)).round() as u32);
        assert_eq!(gcf(3, 4), (1.0e9f32 / (3.0 * 12.0)).round() as u32);
        // Symmetric.
        assert_eq!(gcf(8, 7), gcf(7, 8));
    }

    #[test]
    fn test_gcf_rejects_non_adjacent() {
        for (a, b) in [(3, 5), (5, 3), (4, 6), (6, 4), (10, 8), (7, 7)] {
            assert_eq!(gcf(a, b), 0, "pair ({}, {})", a, b);
        }
        // Out of range indices.
        assert_eq!(gcf(2, 3), 0);
        assert_eq!(gcf(10, 11), 0);
    }

    #[test]
    fn test_timestamp_compact() {
        let mut words = default_metadata_words();
        for (i, t) in [1u16, 2, 3, 4, 5, 6, 7].iter().enumerate() {
            build::set(&mut words, build::TIMESTAMP0 + i, *t);
        }
        let bytes = build::to_bytes(&words);
        let md = Metadata::new(&bytes).unwrap();
        let expect = 1u64 | (2 << 12) | (3 << 24) | (4 << 36) | (5 << 48);
        assert_eq!(md.timestamp(), expect);
    }

    #[test]
    fn test_timestamps_three_word_layout() {
        let mut words = default_metadata_words();
        // ns = 0xfff (word 0 low 12), seconds = 1.
        let ts = [0xfffu16, 0, 0x100, 0, 0, 0, 0];
        for (i, t) in ts.iter().enumerate() {
            build::set(&mut words, build::TIMESTAMP0 + i, *t);
        }
        let bytes = build::to_bytes(&words);
        let md = Metadata::new(&bytes).unwrap();
        let [ns, s_lo, s_hi] = md.timestamps();
        assert_eq!(ns & 0xffff_ffff, 0xfff);
        // Seconds bit 0 lives at bit 12 of t2, which maps to bit 0 of the
        // second output word.
        assert_eq!(s_lo & 0xf, 1);
        assert_eq!(s_hi, 0);
    }

    #[test]
    fn test_adjust_timestamp_zero_is_identity() {
        let mut words = default_metadata_words();
        let ts = [0x0125u16, 0x3456, 0x6787, 0x9ab8, 0xcde9, 0xf01a, 0x234b];
        for (i, t) in ts.iter().enumerate() {
            words[build::TIMESTAMP0 + i] = *t; // raw, not shifted
        }
        let mut bytes = build::to_bytes(&words);
        let before = bytes.clone();
        adjust_timestamp(&mut bytes, 0);
        assert_eq!(bytes, before);
    }

    #[test]
    fn test_adjust_timestamp_large_offset() {
        let mut words = default_metadata_words();
        let ts = [0x0125u16, 0x3456, 0x6787, 0x9ab8, 0xcde9, 0xf01a, 0x234b];
        for (i, t) in ts.iter().enumerate() {
            words[build::TIMESTAMP0 + i] = *t;
        }
        let mut bytes = build::to_bytes(&words);
        adjust_timestamp(&mut bytes, 0xABBACDDCEFFEA);

        let rd = |i: usize| u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        assert_eq!(rd(build::TIMESTAMP0), 0x0125); // ns words untouched
        assert_eq!(rd(build::TIMESTAMP0 + 1), 0x3456);
        assert_eq!(rd(build::TIMESTAMP0 + 2), 0x0780);
        assert_eq!(rd(build::TIMESTAMP0 + 3), 0x9aa0);
        assert_eq!(rd(build::TIMESTAMP0 + 4), 0xaad0);
        assert_eq!(rd(build::TIMESTAMP0 + 5), 0x9cf0);
        assert_eq!(rd(build::TIMESTAMP0 + 6), 0xcf00);
    }

    #[test]
    fn test_saturation_threshold_scaling() {
        let mut words = default_metadata_words();
        build::set(&mut words, build::SATURATION_THRESHOLD, 1000);
        build::set(&mut words, build::REDUCE_MODE, 0);
        let bytes = build::to_bytes(&words);
        let md = Metadata::new(&bytes).unwrap();
        // Engine-side tap rotation: x3, then FPGA pre-scale x2.
        assert_eq!(md.saturation_threshold(), 6000);

        build::set(&mut words, build::REDUCE_MODE, 1);
        let bytes = build::to_bytes(&words);
        let md = Metadata::new(&bytes).unwrap();
        assert_eq!(md.saturation_threshold(), 2000);
    }

    #[test]
    fn test_stripe_mode_overrides() {
        let mut words = default_metadata_words();
        build::set_fov(
            &mut words,
            0,
            build::FOV_ALG_COMMON,
            build::ALG_COMMON_STRIPE,
        );
        build::set_fov(&mut words, 0, build::FOV_NUM_ROIS, 20);
        build::set(&mut words, build::START_STOP_FLAGS, 0);
        let bytes = build::to_bytes(&words);
        let md = Metadata::new(&bytes).unwrap();
        assert!(md.stripe_mode_enabled(0));
        assert!(md.first_roi(0));
        assert!(md.frame_completed(0));
        assert_eq!(md.fov_num_rois(0), 1);
    }

    #[test]
    fn test_nearest_neighbor_level_clamps() {
        let mut words = default_metadata_words();
        build::set_fov(&mut words, 0, build::FOV_NEAREST_NEIGHBOR, 9);
        let bytes = build::to_bytes(&words);
        let md = Metadata::new(&bytes).unwrap();
        assert_eq!(md.nearest_neighbor_level(0), MAX_NEAREST_NEIGHBOR_LEVEL);

        build::set_fov(
            &mut words,
            0,
            build::FOV_ALG_COMMON,
            build::ALG_COMMON_NO_MASKING,
        );
        let bytes = build::to_bytes(&words);
        let md = Metadata::new(&bytes).unwrap();
        assert_eq!(md.nearest_neighbor_level(0), 0);
    }

    #[test]
    fn test_s16_sign_extension() {
        assert_eq!(s16(0xfff, 0xf), -1);
        assert_eq!(s16(0x001, 0x0), 1);
        assert_eq!(s16(0x000, 0x8), i16::MIN);
    }
}
