// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Grid-mode reconstruction: scanned ROI strips accumulate into a
//! full-width raw FOV buffer, and a dedicated worker thread finalizes
//! the whole frame once the last ROI lands.
//!
//! The ROI thread and the worker overlap through ping/pong ownership
//! transfer: on finalize the filled [`RawFrameSet`] moves into the
//! worker's job slot and the previously processed set is reclaimed as
//! the new fill target, so the ROI thread keeps filling FOV N+1 while
//! the worker renders FOV N.

use crate::affinity;
use crate::dsp;
use crate::fov::{self, FovConfig, FovState};
use crate::hdr::Hdr;
use crate::metadata::{Metadata, IMAGE_WIDTH, MAX_IMAGE_HEIGHT, NUM_PHASES};
use crate::nearest;
use crate::pool;
use crate::segment::{FovOutput, FovSegment};
use crate::{binning, pool::ScopedVec};
use ndarray::Array2;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, error, info};

/// The buffers the ROI thread fills and the worker consumes, moved as a
/// unit between the two.
pub struct RawFrameSet {
    /// Pre-binning raw FOV accumulation, one plane per frequency.
    pub raw: [Vec<f32>; 2],
    /// Which unbinned FOV rows have been touched by an ROI.
    pub active_rows: Vec<bool>,
    /// Arrival-order ROI index per unbinned sensor pixel, -1 untouched.
    pub roi_indices: Array2<i32>,
}

impl RawFrameSet {
    fn sized(fov_rows: usize) -> RawFrameSet {
        let plane = NUM_PHASES * fov_rows * IMAGE_WIDTH;
        RawFrameSet {
            raw: [vec![0.0; plane], vec![0.0; plane]],
            active_rows: vec![false; fov_rows],
            roi_indices: Array2::from_elem((MAX_IMAGE_HEIGHT, IMAGE_WIDTH), -1),
        }
    }

    fn clear(&mut self) {
        self.raw[0].fill(0.0);
        self.raw[1].fill(0.0);
        self.active_rows.fill(false);
        self.roi_indices.fill(-1);
    }

    fn fov_rows(&self) -> usize {
        self.active_rows.len()
    }
}

/// Everything the whole-frame worker needs, captured per frame so the
/// engine state may advance while the worker runs.
struct FrameJob {
    set: RawFrameSet,
    config: FovConfig,
    fov_idx: usize,
    head_num: usize,
    timestamp: u64,
    timestamps: Vec<u64>,
    timestamps_vec: Vec<[u32; 3]>,
    row_kernel_idx: usize,
    column_kernel_idx: usize,
    min_max_filter: Option<(usize, usize)>,
    perform_ghost_median: bool,
    incomplete_fov: bool,
    last_roi_received: bool,
    last_roi_idx: i32,
    range_offset_temperature: f32,
    pixel_mask: Arc<Array2<u16>>,
}

struct WorkerState {
    job: Option<FrameJob>,
    reclaimed: Option<RawFrameSet>,
    data_processed: bool,
    quit: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

pub struct GridEngine {
    state: FovState,
    hdr: Hdr,
    current: RawFrameSet,
    /// Per-pixel best snr^2 this frame, the voting record.
    snr_fov: Vec<f32>,
    row_kernel_idx: usize,
    column_kernel_idx: usize,
    min_max_filter: Option<(usize, usize)>,
    perform_ghost_median: bool,
    output: Arc<FovOutput>,
    shared: Arc<WorkerShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl GridEngine {
    pub fn new(fov_idx: usize, head_num: usize, output: Arc<FovOutput>) -> GridEngine {
        GridEngine {
            state: FovState::new(fov_idx, head_num),
            hdr: Hdr::new(),
            current: RawFrameSet::sized(MAX_IMAGE_HEIGHT),
            snr_fov: vec![0.0; MAX_IMAGE_HEIGHT * IMAGE_WIDTH],
            row_kernel_idx: 1,
            column_kernel_idx: 1,
            min_max_filter: None,
            perform_ghost_median: false,
            output,
            shared: Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    job: None,
                    reclaimed: None,
                    data_processed: true,
                    quit: false,
                }),
                cond: Condvar::new(),
            }),
            worker: None,
        }
    }

    pub fn state_mut(&mut self) -> &mut FovState {
        &mut self.state
    }

    /// The previous ROI closed this FOV.
    pub fn last_roi_received(&self) -> bool {
        self.state.prev_roi_was_last
    }

    fn realloc(&mut self, mdat: &Metadata) {
        let fov = self.state.fov_idx;
        let fov_rows = mdat.fov_num_rows(fov) as usize;

        if self.current.fov_rows() != fov_rows {
            self.current = RawFrameSet::sized(fov_rows);
            // Stale scratch sizes are useless after a geometry change.
            pool::clear();
        }
        if self.snr_fov.len() != fov_rows * IMAGE_WIDTH {
            self.snr_fov = vec![0.0; fov_rows * IMAGE_WIDTH];
        }

        let (row_idx, column_idx) = match mdat.binning(fov) {
            4 => (1, 2),
            _ => (2, 3),
        };
        if mdat.disable_phase_smoothing(fov) {
            self.row_kernel_idx = 0;
            self.column_kernel_idx = 0;
        } else {
            self.row_kernel_idx = row_idx;
            self.column_kernel_idx = column_idx;
        }

        self.min_max_filter = if mdat.perform_ghost_min_max(fov) {
            Some(dsp::min_max_filter_size(
                self.row_kernel_idx,
                self.column_kernel_idx,
            ))
        } else {
            None
        };
        self.perform_ghost_median = mdat.perform_ghost_median(fov);
    }

    /// Grid-specific consistency checks layered over the common ones.
    fn save_timestamp(&mut self, mdat: &Metadata) -> bool {
        if !self.state.save_timestamp(mdat) {
            return false;
        }
        let fov = self.state.fov_idx;
        let config = self.state.config.as_ref().unwrap();

        if mdat.scan_table_tag() != config.expected_scan_table_tag {
            return self
                .state
                .drop_roi("skipping ROI, scan table tag changed in the middle of an FOV");
        }
        if mdat.random_fov_tag(fov) != config.expected_fov_tag {
            return self
                .state
                .drop_roi("skipping ROI, FOV tag changed in the middle of an FOV");
        }
        if config.sizes_changed(mdat, fov) {
            return self
                .state
                .drop_roi("skipping ROI, FOV geometry changed relative to the first ROI");
        }
        let roi_start = i32::from(mdat.roi_start_row());
        let fov_start = i32::from(mdat.fov_start_row(fov));
        if roi_start < fov_start
            || roi_start - fov_start + i32::from(mdat.roi_num_rows())
                > i32::from(mdat.fov_num_rows(fov))
        {
            return self.state.drop_roi(
                "skipping ROI specified outside of the FOV, error in the metadata",
            );
        }
        let start_row = mdat.roi_start_row();
        if !self.state.roi_start_rows.contains(&start_row)
            && self.state.roi_start_rows.len() >= mdat.fov_num_rois(fov) as usize
        {
            return self
                .state
                .drop_roi("skipping ROI with an unexpected start row, an ROI was likely missed");
        }
        if !self.state.roi_start_rows.contains(&start_row) {
            self.state.roi_start_rows.push(start_row);
        }
        true
    }

    /// Per-ROI accumulation. Errors drop the ROI; nothing is returned.
    pub fn process_roi(&mut self, roi: &[u8]) {
        if roi.is_empty() || !self.state.validate_metadata(roi) {
            return;
        }

        self.hdr
            .submit(roi, !self.state.very_first_roi_received);
        if !self.state.very_first_roi_received && !self.hdr.skip() {
            debug!(fov = self.state.fov_idx, "first ROI received");
        }
        self.state.very_first_roi_received = true;

        // The HDR-delayed metadata matches the ROI being processed.
        let md_bytes = self.hdr.metadata_bytes().to_vec();
        let mdat = match Metadata::new(&md_bytes) {
            Ok(m) => m,
            Err(_) => return,
        };
        let fov = self.state.fov_idx;

        if mdat.first_roi(fov) {
            if !self.state.reset(&mdat) {
                return;
            }
            self.realloc(&mdat);
            self.current.clear();
            self.snr_fov.fill(0.0);
        }
        if self.hdr.skip() {
            return; // held back one cycle for a possible retake
        }
        if !self.save_timestamp(&mdat) {
            return;
        }

        let roi_rows = mdat.roi_num_rows() as usize;
        let roi_size = (roi_rows, IMAGE_WIDTH);
        let plane = NUM_PHASES * roi_rows * IMAGE_WIDTH;

        let mut roi0: ScopedVec = pool::scoped(plane);
        let mut roi1: ScopedVec = pool::scoped(plane);
        let raw = self.hdr.roi();
        dsp::tap_rotation(raw, &mut roi0, 0, roi_size, mdat.do_tap_accumulation());
        dsp::tap_rotation(raw, &mut roi1, 1, roi_size, mdat.do_tap_accumulation());

        let fov_offset =
            (mdat.roi_start_row() - mdat.fov_start_row(fov)) as usize * IMAGE_WIDTH;
        let [fov0, fov1] = &mut self.current.raw;
        dsp::snr_vote(&roi0, &roi1, fov0, fov1, &mut self.snr_fov, fov_offset);

        let fov_row_base = (mdat.roi_start_row() - mdat.fov_start_row(fov)) as usize;
        for row in 0..roi_rows {
            self.current.active_rows[fov_row_base + row] = true;
            let sensor_row = mdat.roi_start_row() as usize + row;
            if sensor_row < MAX_IMAGE_HEIGHT {
                for col in 0..IMAGE_WIDTH {
                    self.current.roi_indices[(sensor_row, col)] = self.state.current_roi_idx;
                }
            }
        }
    }

    /// Hand the captured frame to the worker and swap the fill target.
    /// Returns immediately; the segment is published asynchronously.
    pub fn process_whole_frame(&mut self) {
        let config = match self.state.config.clone() {
            Some(c) => c,
            None => return,
        };

        let mut guard = self.shared.state.lock().unwrap();
        while !guard.data_processed {
            guard = self.shared.cond.wait(guard).unwrap();
        }

        let replacement = guard
            .reclaimed
            .take()
            .filter(|set| set.fov_rows() == self.current.fov_rows())
            .unwrap_or_else(|| RawFrameSet::sized(self.current.fov_rows()));
        let set = std::mem::replace(&mut self.current, replacement);

        guard.job = Some(FrameJob {
            set,
            fov_idx: self.state.fov_idx,
            head_num: self.state.head_num,
            timestamp: self.state.timestamp,
            timestamps: self.state.timestamps.clone(),
            timestamps_vec: self.state.timestamps_vec.clone(),
            row_kernel_idx: self.row_kernel_idx,
            column_kernel_idx: self.column_kernel_idx,
            min_max_filter: self.min_max_filter,
            perform_ghost_median: self.perform_ghost_median,
            incomplete_fov: self.state.incomplete_fov,
            last_roi_received: self.state.prev_roi_was_last,
            last_roi_idx: self.state.current_roi_idx,
            range_offset_temperature: self.state.tempcal.range_offset(),
            pixel_mask: self.state.pixel_mask.clone(),
            config,
        });
        guard.data_processed = false;
        drop(guard);

        if self.worker.is_none() {
            let shared = self.shared.clone();
            let output = self.output.clone();
            let fov_idx = self.state.fov_idx;
            self.worker = Some(
                thread::Builder::new()
                    .name(format!("whole-frame-{fov_idx}"))
                    .spawn(move || worker_loop(shared, output))
                    .expect("spawning whole-frame worker"),
            );
        }
        self.shared.cond.notify_all();
    }

    /// Stop the worker and wait for it. Called before tearing the engine
    /// down; `Drop` does the same.
    pub fn shutdown(&mut self) {
        {
            let mut guard = self.shared.state.lock().unwrap();
            guard.quit = true;
        }
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for GridEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<WorkerShared>, output: Arc<FovOutput>) {
    info!("whole-frame worker starts");
    affinity::pin_to_big_core(0);
    loop {
        let job = {
            let mut guard = shared.state.lock().unwrap();
            loop {
                if guard.quit {
                    info!("whole-frame worker quitting");
                    return;
                }
                if let Some(job) = guard.job.take() {
                    break job;
                }
                guard = shared.cond.wait(guard).unwrap();
            }
        };

        let (segment, set) = process_frame(job);
        if let Some(segment) = segment {
            output.publish(segment);
        }

        let mut guard = shared.state.lock().unwrap();
        guard.reclaimed = Some(set);
        guard.data_processed = true;
        drop(guard);
        shared.cond.notify_all();
    }
}

/// The whole-frame pipeline: fill gaps, bin, phase, smooth + correct,
/// range, masks, filters, temperature offset, and 16-bit conversion.
fn process_frame(job: FrameJob) -> (Option<FovSegment>, RawFrameSet) {
    if job.config.disable_rtd {
        return (None, job.set);
    }
    if job.incomplete_fov {
        error!(
            fov = job.fov_idx,
            "skipping whole-frame processing, incomplete FOV received"
        );
        return (None, job.set);
    }
    if job.config.expected_num_rois as i32 != job.last_roi_idx + 1 || !job.last_roi_received {
        return (None, job.set);
    }

    let config = &job.config;
    let size = config.size;
    let pixels = size.0 * size.1;
    let prebinned = (size.0 * config.binning, size.1 * config.binning);

    let mut f0_binned = pool::scoped(NUM_PHASES * pixels);
    let mut f1_binned = pool::scoped(NUM_PHASES * pixels);
    {
        let mut f0_filled = pool::scoped(job.set.raw[0].len());
        let mut f1_filled = pool::scoped(job.set.raw[1].len());
        dsp::fill_missing_rows(&job.set.raw[0], &mut f0_filled, prebinned, &job.set.active_rows);
        dsp::fill_missing_rows(&job.set.raw[1], &mut f1_filled, prebinned, &job.set.active_rows);
        binning::bin_mxn(&f0_filled, &mut f0_binned, prebinned, config.binning);
        binning::bin_mxn(&f1_filled, &mut f1_binned, prebinned, config.binning);
    }

    let mut f0_phase = pool::scoped(pixels);
    let mut f1_phase = pool::scoped(pixels);
    let mut signal = pool::scoped(pixels);
    let mut snr = pool::scoped(pixels);
    let mut background = pool::scoped(pixels);
    signal.fill(0.0);
    snr.fill(0.0);
    background.fill(0.0);
    let summed = (config.binning * config.binning) as f32;
    dsp::calculate_phase(&f0_binned, &mut f0_phase, &mut signal, &mut snr, &mut background, summed);
    dsp::calculate_phase(&f1_binned, &mut f1_phase, &mut signal, &mut snr, &mut background, summed);

    let mut f0_smoothed = pool::scoped(f0_binned.len());
    let mut f1_smoothed = pool::scoped(f1_binned.len());
    dsp::smooth_summed(&f0_binned, &mut f0_smoothed, size, job.row_kernel_idx, job.column_kernel_idx);
    dsp::smooth_summed(&f1_binned, &mut f1_smoothed, size, job.row_kernel_idx, job.column_kernel_idx);

    let mut phase_smoothed0 = pool::scoped(pixels);
    let mut phase_smoothed1 = pool::scoped(pixels);
    let mut corrected0 = pool::scoped(pixels);
    let mut corrected1 = pool::scoped(pixels);
    let mut m_frame = pool::scoped(pixels);
    let mut ranges = pool::scoped(pixels);
    let mut filtered_ranges = pool::scoped(pixels);
    let mut min_max_mask = pool::scoped(pixels);

    dsp::calculate_phase_smooth(&f0_smoothed, &mut phase_smoothed0, &f0_phase, &mut corrected0);
    dsp::calculate_phase_smooth(&f1_smoothed, &mut phase_smoothed1, &f1_phase, &mut corrected1);
    dsp::compute_range(
        &phase_smoothed0,
        &phase_smoothed1,
        &corrected0,
        &corrected1,
        &mut ranges,
        config.fs,
        config.fs_int,
        &mut m_frame,
    );

    dsp::min_max_recursive(&m_frame, &mut min_max_mask, job.min_max_filter, size, 1.0);
    dsp::median_filter_plus(
        &ranges,
        &mut filtered_ranges,
        (job.row_kernel_idx, job.column_kernel_idx),
        size,
        job.perform_ghost_median,
    );
    nearest::remove_outliers(&mut filtered_ranges, config.nearest_neighbor_level, size);

    let mur = config.max_unambiguous_range() as f32;
    let offset = job.range_offset_temperature;
    for range in filtered_ranges.iter_mut() {
        *range = ((*range - offset).max(0.0)) % mur;
    }

    let ranges_u16 = fov::range_to_u16(
        &filtered_ranges,
        &min_max_mask,
        &job.pixel_mask,
        &snr,
        config.sensor_fov_start,
        config.sensor_fov_step,
        size,
        config.disable_range_masking,
        config.snr_thresh,
        config.range_limit,
    );
    let roi_indices = fov::roi_indices_to_u16(
        &job.set.roi_indices,
        config.sensor_fov_start,
        config.sensor_fov_step,
        size,
    );

    let segment = FovSegment {
        fov_idx: job.fov_idx,
        head_num: job.head_num,
        timestamp: job.timestamp,
        sensor_id: config.sensor_id,
        user_tag: config.user_tag,
        frame_completed: job.last_roi_received,
        disable_streaming: config.disable_streaming,
        gcf: f64::from(config.gcf),
        max_unambiguous_range: config.max_unambiguous_range(),
        image_size: size,
        ranges: ranges_u16,
        snr: fov::snr_to_u16(&snr),
        signal: fov::signal_to_u16(&signal),
        background: fov::background_to_u16(&background),
        roi_indices,
        timestamps: job.timestamps,
        timestamps_vec: job.timestamps_vec,
        mapping_table_start: config.mapping_table_start,
        mapping_table_step: config.mapping_table_step,
        fov_start: (
            u32::from(config.sensor_fov_start.0) / config.binning as u32,
            u32::from(config.sensor_fov_start.1) / config.binning as u32,
        ),
        fov_step: (config.binning as u32, config.binning as u32),
        mapping_table: None,
        new_mapping_table: false,
    };

    (Some(segment), job.set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{build, default_metadata_words, SATURATION_THRESHOLD_DISABLED};

    const FOV_ROWS: u16 = 20;
    const ROI_ROWS: u16 = 10;

    fn roi_words(start_row: u16, flags: u16, counter: u16, fov_tag: u16) -> Vec<u16> {
        let mut words = default_metadata_words();
        build::set(&mut words, build::ROI_START_ROW, start_row);
        build::set(&mut words, build::ROI_NUM_ROWS, ROI_ROWS);
        build::set(&mut words, build::START_STOP_FLAGS, flags);
        build::set(&mut words, build::ROI_COUNTER, counter);
        build::set(
            &mut words,
            build::SATURATION_THRESHOLD,
            SATURATION_THRESHOLD_DISABLED,
        );
        build::set_fov(&mut words, 0, build::FOV_NUM_ROWS, FOV_ROWS);
        build::set_fov(&mut words, 0, build::FOV_NUM_ROIS, 2);
        build::set_fov(&mut words, 0, build::FOV_RANDOM_TAG, fov_tag);
        words
    }

    fn roi_bytes(words: &[u16], fill: u16) -> Vec<u8> {
        let mut bytes = build::to_bytes(words);
        // Engine-side tap rotation: three permutations of two frequencies.
        let payload = ROI_ROWS as usize * IMAGE_WIDTH * NUM_PHASES * 2 * 3;
        let word = (fill << 4).to_le_bytes();
        for _ in 0..payload {
            bytes.extend_from_slice(&word);
        }
        bytes
    }

    fn drain_output(engine: &GridEngine) -> Option<FovSegment> {
        // The worker publishes asynchronously.
        for _ in 0..500 {
            if engine.output.available() {
                return engine.output.take();
            }
            thread::sleep(std::time::Duration::from_millis(2));
        }
        None
    }

    #[test]
    fn test_two_roi_fov_produces_segment() {
        let output = Arc::new(FovOutput::default());
        let mut engine = GridEngine::new(0, 0, output.clone());

        let first = roi_bytes(&roi_words(0, 0x1, 0, 7), 200);
        let last = roi_bytes(&roi_words(10, 0x2, 1, 7), 200);
        engine.process_roi(&first);
        engine.process_roi(&last);
        assert!(engine.last_roi_received());
        engine.process_whole_frame();

        let segment = drain_output(&engine).expect("segment published");
        assert_eq!(segment.image_size, (FOV_ROWS as usize, IMAGE_WIDTH));
        assert_eq!(segment.timestamps.len(), 2);
        assert!(segment.frame_completed);
        let mur = segment.max_unambiguous_range;
        for &r in &segment.ranges {
            assert!((f64::from(r) / 1024.0) < mur + 0.01);
        }
        engine.shutdown();
    }

    #[test]
    fn test_mid_fov_tag_flip_drops_and_recovers() {
        let output = Arc::new(FovOutput::default());
        let mut engine = GridEngine::new(0, 0, output.clone());

        // First ROI with tag A, second with tag B: second dropped,
        // finalization skipped.
        engine.process_roi(&roi_bytes(&roi_words(0, 0x1, 0, 7), 100));
        engine.process_roi(&roi_bytes(&roi_words(10, 0x2, 1, 9), 100));
        assert!(engine.last_roi_received());
        engine.process_whole_frame();
        assert!(drain_output(&engine).is_none());

        // The next FOV with a first-roi recovers.
        engine.process_roi(&roi_bytes(&roi_words(0, 0x1, 2, 9), 100));
        engine.process_roi(&roi_bytes(&roi_words(10, 0x2, 3, 9), 100));
        engine.process_whole_frame();
        assert!(drain_output(&engine).is_some());
        engine.shutdown();
    }

    #[test]
    fn test_duplicate_start_row_dropped() {
        let output = Arc::new(FovOutput::default());
        let mut engine = GridEngine::new(0, 0, output.clone());

        engine.process_roi(&roi_bytes(&roi_words(0, 0x1, 0, 7), 100));
        // The same start row again once the expected set is exhausted is
        // fine (revisit); exhaust the list first with a foreign row.
        engine.process_roi(&roi_bytes(&roi_words(10, 0x0, 1, 7), 100));
        // Expected count is 2, so a third ROI overruns and is dropped.
        engine.process_roi(&roi_bytes(&roi_words(5, 0x2, 2, 7), 100));
        engine.process_whole_frame();
        assert!(drain_output(&engine).is_none());
        engine.shutdown();
    }

    #[test]
    fn test_roi_outside_fov_dropped() {
        let output = Arc::new(FovOutput::default());
        let mut engine = GridEngine::new(0, 0, output.clone());

        let mut words = roi_words(16, 0x1, 0, 7);
        // 16 + 10 rows > 20 FOV rows.
        build::set(&mut words, build::START_STOP_FLAGS, 0x3);
        engine.process_roi(&roi_bytes(&words, 100));
        engine.process_whole_frame();
        assert!(drain_output(&engine).is_none());
        engine.shutdown();
    }
}
