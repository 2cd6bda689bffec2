// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Reconstructed output of one FOV, handed from the engines to the
//! network wrappers.

use crate::calibration::MappingTable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One finalized FOV: 16-bit output fields plus the geometry the network
/// consumer needs to place them.
pub struct FovSegment {
    pub fov_idx: usize,
    pub head_num: usize,
    /// Compact 64-bit timestamp representing the whole FOV.
    pub timestamp: u64,
    pub sensor_id: u16,
    pub user_tag: u16,
    /// True when this segment closes its frame.
    pub frame_completed: bool,
    /// The metadata asked for this FOV to stay off the network.
    pub disable_streaming: bool,
    pub gcf: f64,
    pub max_unambiguous_range: f64,
    /// Binned output size (rows, cols).
    pub image_size: (usize, usize),

    pub ranges: Vec<u16>,
    pub snr: Vec<u16>,
    pub signal: Vec<u16>,
    pub background: Vec<u16>,
    /// Which arrival-order ROI produced each output pixel.
    pub roi_indices: Vec<u16>,

    /// Per-ROI timestamps in arrival order, compact form.
    pub timestamps: Vec<u64>,
    /// Per-ROI timestamps, extended three-word form.
    pub timestamps_vec: Vec<[u32; 3]>,

    /// Top-left of this FOV inside the mapping table, and the step.
    pub mapping_table_start: (u32, u32),
    pub mapping_table_step: (u32, u32),
    /// Top-left of this FOV on the binned sensor, and the step.
    pub fov_start: (u32, u32),
    pub fov_step: (u32, u32),

    /// Present when a freshly loaded mapping table should reach the
    /// client ahead of this segment.
    pub mapping_table: Option<Arc<MappingTable>>,
    pub new_mapping_table: bool,
}

impl FovSegment {
    pub fn pixel_count(&self) -> usize {
        self.image_size.0 * self.image_size.1
    }
}

/// Hand-off slot between a finalizer and the consumer polling for
/// completed FOVs. The producer stores a segment and raises the flag;
/// [`FovOutput::take`] transfers ownership and clears it.
#[derive(Default)]
pub struct FovOutput {
    available: AtomicBool,
    segment: Mutex<Option<FovSegment>>,
}

impl FovOutput {
    pub fn publish(&self, segment: FovSegment) {
        *self.segment.lock().unwrap() = Some(segment);
        self.available.store(true, Ordering::Release);
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn take(&self) -> Option<FovSegment> {
        if !self.available() {
            return None;
        }
        let segment = self.segment.lock().unwrap().take();
        self.available.store(false, Ordering::Release);
        segment
    }
}
