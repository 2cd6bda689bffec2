// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-FOV reconstruction state shared by the grid and stripe engines:
//! the geometry captured from the first ROI of each FOV, the validation
//! state machine that drops malformed ROIs, and the float-to-16-bit
//! output conversions.
//!
//! Validation never aborts the engine. A bad ROI is dropped and the FOV
//! is marked incomplete so finalization is skipped; the state heals at
//! the next first-roi.

use crate::metadata::{
    self, Metadata, C_MPS, MD_ROW_BYTES, MD_STRUCT_BYTES, RANGE_LIMIT_FRACTION,
    RANGE_NETWORK_SCALE, SENSOR_MODE_DMFD,
};
use crate::tempcal::TemperatureCalibration;
use ndarray::Array2;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, error};

/// Destination of the metadata-flagged raw ROI dump.
const RAW_DUMP_PATH: &str = "/run/cobra_accumulated_raw_rois_0000.bin";

/// Geometry and processing parameters of one FOV, captured at reset from
/// the first ROI of the frame.
#[derive(Clone)]
pub struct FovConfig {
    pub binning: usize,
    /// Output size after binning (rows, cols).
    pub size: (usize, usize),
    pub mapping_table_start: (u32, u32),
    pub mapping_table_step: (u32, u32),
    /// Unbinned FOV placement on the sensor.
    pub sensor_fov_start: (u16, u16),
    pub sensor_fov_size: (u16, u16),
    pub sensor_fov_step: (u16, u16),
    pub roi_num_rows: usize,
    pub expected_num_rois: usize,
    pub expected_scan_table_tag: u16,
    pub expected_fov_tag: u16,
    pub fov_start_row: u16,
    pub gcf: f32,
    pub fs: [f32; 2],
    pub fs_int: [f32; 2],
    pub snr_thresh: f32,
    pub sensor_id: u16,
    pub user_tag: u16,
    pub disable_streaming: bool,
    pub disable_range_masking: bool,
    pub disable_rtd: bool,
    pub nearest_neighbor_level: u16,
    pub do_tap_accumulation: bool,
    pub range_limit: f32,
}

impl FovConfig {
    pub fn from_metadata(mdat: &Metadata, fov: usize) -> Option<FovConfig> {
        let gcf = metadata::gcf(mdat.f0_modulation_index(), mdat.f1_modulation_index());
        if gcf == 0 {
            return None;
        }
        let gcf = gcf as f32;
        let fs = [
            metadata::modulation_frequency(mdat.f0_modulation_index()),
            metadata::modulation_frequency(mdat.f1_modulation_index()),
        ];
        let binning = mdat.binning(fov) as usize;
        let max_unambiguous = 0.5 * C_MPS / gcf;
        let range_limit = if mdat.enable_max_range_limit(fov) {
            RANGE_LIMIT_FRACTION * max_unambiguous
        } else {
            f32::MAX
        };

        Some(FovConfig {
            binning,
            size: (
                mdat.full_image_height(fov) as usize,
                mdat.full_image_width(fov) as usize,
            ),
            // Indices into the double-density calibration table.
            mapping_table_start: (
                2 * u32::from(mdat.fov_start_row(fov)) + binning as u32 - 1,
                2 * u32::from(Metadata::roi_start_column()) + binning as u32 - 1,
            ),
            mapping_table_step: (2 * binning as u32, 2 * binning as u32),
            sensor_fov_start: (mdat.fov_start_row(fov), Metadata::roi_start_column()),
            sensor_fov_size: (mdat.fov_num_rows(fov), Metadata::roi_num_columns()),
            sensor_fov_step: (mdat.binning(fov), mdat.binning(fov)),
            roi_num_rows: mdat.roi_num_rows() as usize,
            expected_num_rois: mdat.fov_num_rois(fov) as usize,
            expected_scan_table_tag: mdat.scan_table_tag(),
            expected_fov_tag: mdat.random_fov_tag(fov),
            fov_start_row: mdat.fov_start_row(fov),
            gcf,
            fs,
            fs_int: [(fs[0] / gcf).round(), (fs[1] / gcf).round()],
            snr_thresh: mdat.snr_thresh(fov),
            sensor_id: mdat.sensor_id(),
            user_tag: mdat.user_tag(fov),
            disable_streaming: mdat.disable_streaming(),
            disable_range_masking: mdat.disable_range_masking(fov),
            disable_rtd: mdat.disable_rtd(fov),
            nearest_neighbor_level: mdat.nearest_neighbor_level(fov),
            do_tap_accumulation: mdat.do_tap_accumulation(),
            range_limit,
        })
    }

    pub fn max_unambiguous_range(&self) -> f64 {
        0.5 * f64::from(C_MPS) / f64::from(self.gcf)
    }

    /// True when the sizes this metadata announces no longer match the
    /// captured configuration (a first-roi was missed).
    pub fn sizes_changed(&self, mdat: &Metadata, fov: usize) -> bool {
        self.size
            != (
                mdat.full_image_height(fov) as usize,
                mdat.full_image_width(fov) as usize,
            )
            || self.binning != mdat.binning(fov) as usize
            || self.sensor_fov_start != (mdat.fov_start_row(fov), Metadata::roi_start_column())
            || self.sensor_fov_size != (mdat.fov_num_rows(fov), Metadata::roi_num_columns())
            || self.expected_num_rois != mdat.fov_num_rois(fov) as usize
            || self.fs[0] != metadata::modulation_frequency(mdat.f0_modulation_index())
            || self.fs[1] != metadata::modulation_frequency(mdat.f1_modulation_index())
            || self.fov_start_row != mdat.fov_start_row(fov)
    }
}

/// Mutable per-FOV frame progress shared by both engine kinds.
pub struct FovState {
    pub fov_idx: usize,
    pub head_num: usize,
    pub config: Option<FovConfig>,
    pub timestamp: u64,
    pub timestamps: Vec<u64>,
    pub timestamps_vec: Vec<[u32; 3]>,
    pub roi_start_rows: Vec<u16>,
    /// Arrival-order index of the ROI being processed; -1 before the
    /// first ROI of a frame.
    pub current_roi_idx: i32,
    pub prev_roi_was_last: bool,
    pub incomplete_fov: bool,
    pub very_first_roi_received: bool,
    pub tempcal: TemperatureCalibration,
    pub pixel_mask: Arc<Array2<u16>>,
}

impl FovState {
    pub fn new(fov_idx: usize, head_num: usize) -> FovState {
        FovState {
            fov_idx,
            head_num,
            config: None,
            timestamp: 0,
            timestamps: Vec::new(),
            timestamps_vec: Vec::new(),
            roi_start_rows: Vec::new(),
            current_roi_idx: -1,
            prev_roi_was_last: false,
            incomplete_fov: false,
            very_first_roi_received: false,
            tempcal: TemperatureCalibration::new(),
            pixel_mask: Arc::new(crate::calibration::default_pixel_mask()),
        }
    }

    pub fn set_pixel_mask(&mut self, mask: Arc<Array2<u16>>) {
        self.pixel_mask = mask;
    }

    /// Mark the ROI dropped and the FOV incomplete.
    pub fn drop_roi(&mut self, reason: &str) -> bool {
        if !reason.is_empty() {
            error!(fov = self.fov_idx, "{}", reason);
        }
        self.incomplete_fov = true;
        false
    }

    /// Buffer and metadata sanity ahead of any processing. Returns false
    /// when the ROI must be ignored outright.
    pub fn validate_metadata(&self, roi: &[u8]) -> bool {
        if roi.len() < MD_STRUCT_BYTES {
            error!(
                len = roi.len(),
                "input buffer too small for metadata, dropping ROI"
            );
            return false;
        }
        let mdat = match Metadata::new(roi) {
            Ok(m) => m,
            Err(err) => {
                error!(%err, "dropping ROI");
                return false;
            }
        };

        let expected = MD_ROW_BYTES + mdat.roi_payload_bytes();
        if roi.len() < expected {
            error!(
                expected,
                len = roi.len(),
                "input buffer too small for image data, dropping ROI"
            );
            return false;
        }

        if mdat.sensor_mode() != SENSOR_MODE_DMFD {
            error!("only DMFD sensor mode is supported, dropping ROI");
            return false;
        }
        if mdat.num_modulation_frequencies() != 2 {
            error!("the number of modulation frequencies must be 2, dropping ROI");
            return false;
        }
        let (f0, f1) = (mdat.f0_modulation_index(), mdat.f1_modulation_index());
        if i32::from(f1) - i32::from(f0) != 1 {
            error!(f0, f1, "modulation indices must be adjacent with f0 below f1, dropping ROI");
            return false;
        }

        if !self.very_first_roi_received && !mdat.first_roi(self.fov_idx) {
            debug!(
                roi_counter = mdat.roi_counter(),
                "ignoring ROI before the first first-roi of this FOV"
            );
            return false;
        }
        if !self.very_first_roi_received && mdat.was_previous_roi_saturated() {
            error!("first ever ROI is marked as an HDR retake, dropping ROI");
            return false;
        }

        self.dump_raw_roi(roi, &mdat);
        true
    }

    fn dump_raw_roi(&self, roi: &[u8], mdat: &Metadata) {
        if !mdat.dump_raw_roi(self.fov_idx) {
            return;
        }
        debug!(path = RAW_DUMP_PATH, "saving raw ROI");
        match std::fs::File::create(RAW_DUMP_PATH) {
            Ok(mut f) => {
                if let Err(err) = f.write_all(roi) {
                    error!(%err, "raw ROI dump failed");
                }
            }
            Err(err) => error!(%err, "raw ROI dump failed"),
        }
    }

    /// Reset frame progress at the first ROI of an FOV. Returns false
    /// when the metadata carries unusable modulation indices.
    pub fn reset(&mut self, mdat: &Metadata) -> bool {
        self.prev_roi_was_last = false;
        self.incomplete_fov = false;
        self.current_roi_idx = -1;

        let config = match FovConfig::from_metadata(mdat, self.fov_idx) {
            Some(c) => c,
            None => return false,
        };
        let num_rois = config.expected_num_rois;
        self.timestamps = vec![0; num_rois];
        self.timestamps_vec = vec![[0; 3]; num_rois];
        self.roi_start_rows.clear();
        self.roi_start_rows.reserve(num_rois);
        self.timestamp = mdat.timestamp();
        self.config = Some(config);
        true
    }

    /// The common per-ROI state checks: captures the ADC values, records
    /// the timestamp into the arrival-order slot, enforces the expected
    /// ROI count. Returns false when the ROI is to be skipped.
    pub fn save_timestamp(&mut self, mdat: &Metadata) -> bool {
        let fov = self.fov_idx;
        self.tempcal.set_adc_values(mdat, fov);
        self.prev_roi_was_last = mdat.frame_completed(fov);
        if mdat.disable_rtd(fov) {
            self.incomplete_fov = true;
            return false;
        }

        self.current_roi_idx += 1;
        if self.current_roi_idx as usize >= self.timestamps.len() {
            let expected = self.timestamps.len();
            return self.drop_roi(&format!(
                "skipping ROI, likely missed the first-roi: expected {} ROIs, received {}",
                expected,
                self.current_roi_idx + 1
            ));
        }

        let idx = self.current_roi_idx as usize;
        self.timestamps[idx] = mdat.timestamp();
        self.timestamps_vec[idx] = mdat.timestamps();
        true
    }
}

/// Convert ranges to the 16-bit wire format, applying the mask stack.
///
/// A pixel is invalidated (range forced to exactly zero) when the
/// min-max mask fires, its SNR falls below twice the threshold, the
/// pixel mask excludes it, or it exceeds the range limit; all of it
/// suppressed by disable-range-masking.
#[allow(clippy::too_many_arguments)]
pub fn range_to_u16(
    ranges: &[f32],
    min_max_mask: &[f32],
    pixel_mask: &Array2<u16>,
    snr: &[f32],
    sensor_fov_start: (u16, u16),
    sensor_fov_step: (u16, u16),
    size: (usize, usize),
    disable_range_masking: bool,
    snr_thresh: f32,
    range_limit: f32,
) -> Vec<u16> {
    let mut out = vec![0u16; ranges.len()];
    let (rows, cols) = (pixel_mask.dim().0, pixel_mask.dim().1);

    for (idx, out_val) in out.iter_mut().enumerate() {
        let x = idx % size.1;
        let y = idx / size.1;
        let mask_x = sensor_fov_start.1 as usize + x * sensor_fov_step.1 as usize;
        let mask_y = sensor_fov_start.0 as usize + y * sensor_fov_step.0 as usize;

        let masked_out = mask_y < rows && mask_x < cols && pixel_mask[(mask_y, mask_x)] == 0;
        let min_max_masked = min_max_mask[idx] > 0.5;

        let mut range = ranges[idx];
        if !disable_range_masking
            && (min_max_masked
                || snr[idx] < 2.0 * snr_thresh
                || masked_out
                || range > range_limit)
        {
            range = 0.0;
        }
        *out_val = (RANGE_NETWORK_SCALE * range).round().min(65535.0) as u16;
    }
    out
}

/// Signal output: the two-frequency sum halved, clamped to 16 bits.
pub fn signal_to_u16(signal: &[f32]) -> Vec<u16> {
    signal
        .iter()
        .map(|&s| (0.5 * s).round().min(65535.0) as u16)
        .collect()
}

/// Background output: the accumulated value already represents the
/// two-frequency average (one halving was elided upstream).
pub fn background_to_u16(background: &[f32]) -> Vec<u16> {
    background
        .iter()
        .map(|&b| b.round().min(65535.0) as u16)
        .collect()
}

/// SNR output: the two-frequency sum halved and rounded.
pub fn snr_to_u16(snr: &[f32]) -> Vec<u16> {
    snr.iter()
        .map(|&s| (0.5 * s).round().min(65535.0) as u16)
        .collect()
}

/// Walk the sensor-plane ROI-index image with the FOV geometry and emit
/// one index per output pixel. Unassigned pixels (-1) inherit the last
/// good index above and to the left.
pub fn roi_indices_to_u16(
    roi_indices: &Array2<i32>,
    fov_start: (u16, u16),
    fov_step: (u16, u16),
    size: (usize, usize),
) -> Vec<u16> {
    let mut out = vec![0u16; size.0 * size.1];
    let mut last_good = 0u16;
    for (idx, out_val) in out.iter_mut().enumerate() {
        let x = fov_start.1 as usize + (idx % size.1) * fov_step.1 as usize;
        let y = fov_start.0 as usize + (idx / size.1) * fov_step.0 as usize;
        let roi_index = if y < roi_indices.dim().0 && x < roi_indices.dim().1 {
            roi_indices[(y, x)]
        } else {
            -1
        };
        if roi_index < 0 {
            *out_val = last_good;
        } else {
            last_good = roi_index as u16;
            *out_val = last_good;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::default_pixel_mask;
    use crate::metadata::{build, default_metadata_words};

    fn md_bytes() -> Vec<u8> {
        build::to_bytes(&default_metadata_words())
    }

    #[test]
    fn test_config_from_default_metadata() {
        let bytes = md_bytes();
        let mdat = Metadata::new(&bytes).unwrap();
        let config = FovConfig::from_metadata(&mdat, 0).unwrap();
        assert_eq!(config.size, (480, 640));
        assert_eq!(config.binning, 1);
        assert_eq!(config.fs_int, [8.0, 7.0]);
        assert_eq!(config.expected_num_rois, 1);
        assert!(config.range_limit == f32::MAX);
    }

    #[test]
    fn test_config_range_limit() {
        let mut words = default_metadata_words();
        build::set_fov(
            &mut words,
            0,
            build::FOV_ALG_COMMON,
            build::ALG_COMMON_RANGE_LIMIT,
        );
        let bytes = build::to_bytes(&words);
        let mdat = Metadata::new(&bytes).unwrap();
        let config = FovConfig::from_metadata(&mdat, 0).unwrap();
        let mur = config.max_unambiguous_range() as f32;
        assert!((config.range_limit - 0.8 * mur).abs() < 1e-3);
    }

    #[test]
    fn test_validate_rejects_non_adjacent_indices() {
        let mut words = default_metadata_words();
        build::set(&mut words, build::F0_MOD_IDX, 5);
        build::set(&mut words, build::F1_MOD_IDX, 8);
        let mut bytes = build::to_bytes(&words);
        bytes.resize(MD_ROW_BYTES + 480 * 640 * 3 * 2 * 2 * 3, 0);
        let state = FovState::new(0, 0);
        assert!(!state.validate_metadata(&bytes));
    }

    #[test]
    fn test_validate_rejects_undersized_buffer() {
        let bytes = md_bytes(); // no payload at all
        let state = FovState::new(0, 0);
        assert!(!state.validate_metadata(&bytes));
    }

    #[test]
    fn test_save_timestamp_over_count() {
        let bytes = md_bytes();
        let mdat = Metadata::new(&bytes).unwrap();
        let mut state = FovState::new(0, 0);
        assert!(state.reset(&mdat));
        assert!(state.save_timestamp(&mdat));
        // Default metadata expects a single ROI; a second one overruns.
        assert!(!state.save_timestamp(&mdat));
        assert!(state.incomplete_fov);
    }

    #[test]
    fn test_range_masking() {
        let ranges = vec![1.0f32, 2.0, 3.0, 4.0];
        let min_max = vec![0.0f32, 1.0, 0.0, 0.0];
        let snr = vec![10.0f32, 10.0, 0.1, 10.0];
        let mask = default_pixel_mask();

        let out = range_to_u16(
            &ranges,
            &min_max,
            &mask,
            &snr,
            (0, 0),
            (1, 1),
            (1, 4),
            false,
            1.0,
            3.5,
        );
        assert_eq!(out[0], 1024); // clean pixel, 1 m
        assert_eq!(out[1], 0); // min-max masked
        assert_eq!(out[2], 0); // snr below 2x threshold
        assert_eq!(out[3], 0); // beyond range limit
    }

    #[test]
    fn test_range_masking_disabled() {
        let ranges = vec![4.0f32];
        let min_max = vec![1.0f32];
        let snr = vec![0.0f32];
        let mask = default_pixel_mask();
        let out = range_to_u16(
            &ranges,
            &min_max,
            &mask,
            &snr,
            (0, 0),
            (1, 1),
            (1, 1),
            true,
            100.0,
            0.5,
        );
        assert_eq!(out[0], 4096);
    }

    #[test]
    fn test_roi_indices_substitution() {
        let mut image = Array2::from_elem((4, 4), -1i32);
        image[(0, 0)] = 2;
        image[(0, 2)] = 5;
        let out = roi_indices_to_u16(&image, (0, 0), (1, 1), (1, 4));
        assert_eq!(out, vec![2, 2, 5, 5]);
    }

    #[test]
    fn test_output_scaling() {
        assert_eq!(signal_to_u16(&[10.0])[0], 5);
        assert_eq!(snr_to_u16(&[9.0])[0], 5); // rounded
        assert_eq!(background_to_u16(&[7.4])[0], 7);
        // Clamps.
        assert_eq!(signal_to_u16(&[1.0e9])[0], 65535);
    }
}
