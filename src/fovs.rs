// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! FOV multiplexer: one reconstruction engine per active FOV slot.
//!
//! Each incoming ROI fans out to the engines named by its active-FOV
//! bitmask; engines are built on first use and rebuilt when the
//! grid/stripe mode bit flips. Finished segments land in per-FOV output
//! slots that the ingest thread drains between ROIs.

use crate::calibration::{self, MappingTable};
use crate::grid::GridEngine;
use crate::metadata::{Metadata, MAX_ACTIVE_FOVS};
use crate::segment::{FovOutput, FovSegment};
use crate::stripe::StripeEngine;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Default mapping-table location, suffixed by the head letter.
const MAPPING_TABLE_FILE_ROOT: &str = "/home/root/cobra/mapping_table_";
/// Default pixel-mask location, suffixed by the head letter.
const PIXEL_MASK_FILE_ROOT: &str = "/run/lumotive/pixel_mask_";

const HEAD_LETTERS: [char; 4] = ['A', 'B', 'C', 'D'];

/// The two reconstruction specializations behind one dispatch surface.
pub enum Engine {
    Grid(GridEngine),
    Stripe(StripeEngine),
}

impl Engine {
    fn process_roi(&mut self, roi: &[u8]) {
        match self {
            Engine::Grid(e) => e.process_roi(roi),
            Engine::Stripe(e) => e.process_roi(roi),
        }
    }

    fn last_roi_received(&self) -> bool {
        match self {
            Engine::Grid(e) => e.last_roi_received(),
            Engine::Stripe(e) => e.last_roi_received(),
        }
    }

    fn process_whole_frame(&mut self) {
        match self {
            Engine::Grid(e) => e.process_whole_frame(),
            Engine::Stripe(e) => e.process_whole_frame(),
        }
    }

    fn set_pixel_mask(&mut self, mask: Arc<Array2<u16>>) {
        match self {
            Engine::Grid(e) => e.state_mut().set_pixel_mask(mask),
            Engine::Stripe(e) => e.state_mut().set_pixel_mask(mask),
        }
    }

    fn is_grid(&self) -> bool {
        matches!(self, Engine::Grid(_))
    }
}

pub struct RawToFovs {
    head_num: usize,
    engines: [Option<Engine>; MAX_ACTIVE_FOVS],
    outputs: [Arc<FovOutput>; MAX_ACTIVE_FOVS],
    mapping_table: Option<Arc<MappingTable>>,
    new_mapping_table: [bool; MAX_ACTIVE_FOVS],
    new_pixel_mask: [bool; MAX_ACTIVE_FOVS],
    pixel_mask: Arc<Array2<u16>>,
}

impl RawToFovs {
    pub fn new(head_num: usize) -> RawToFovs {
        RawToFovs {
            head_num,
            engines: Default::default(),
            outputs: std::array::from_fn(|_| Arc::new(FovOutput::default())),
            mapping_table: None,
            new_mapping_table: [false; MAX_ACTIVE_FOVS],
            new_pixel_mask: [false; MAX_ACTIVE_FOVS],
            pixel_mask: Arc::new(calibration::default_pixel_mask()),
        }
    }

    /// Build or rebuild the engine for a slot so its kind matches the
    /// metadata's mode bit.
    fn ensure_engine(&mut self, mdat: &Metadata, fov: usize) {
        let want_grid = mdat.grid_mode_enabled(fov);
        let rebuild = match &self.engines[fov] {
            Some(engine) => engine.is_grid() != want_grid,
            None => true,
        };
        if !rebuild {
            return;
        }
        if let Some(Engine::Grid(mut old)) = self.engines[fov].take() {
            old.shutdown();
        }
        let output = self.outputs[fov].clone();
        let mut engine = if want_grid {
            Engine::Grid(GridEngine::new(fov, self.head_num, output))
        } else {
            Engine::Stripe(StripeEngine::new(fov, self.head_num, output))
        };
        engine.set_pixel_mask(self.pixel_mask.clone());
        self.engines[fov] = Some(engine);
    }

    /// Entry point: run the per-ROI path for every FOV this ROI feeds,
    /// kicking whole-frame finalization wherever the frame closed.
    pub fn process_roi(&mut self, roi: &[u8]) {
        let mdat = match Metadata::new(roi) {
            Ok(m) => m,
            Err(err) => {
                error!(%err, "dropping ROI");
                return;
            }
        };

        for fov in mdat.active_fovs() {
            self.ensure_engine(&mdat, fov);

            if self.new_pixel_mask[fov] {
                self.new_pixel_mask[fov] = false;
                if let Some(engine) = self.engines[fov].as_mut() {
                    engine.set_pixel_mask(self.pixel_mask.clone());
                }
            }

            let engine = self.engines[fov].as_mut().unwrap();
            engine.process_roi(roi);
            if engine.last_roi_received() {
                engine.process_whole_frame();
            }
        }
    }

    /// FOVs with a finished segment waiting.
    pub fn fovs_available(&self) -> Vec<usize> {
        (0..MAX_ACTIVE_FOVS)
            .filter(|&fov| self.engines[fov].is_some() && self.outputs[fov].available())
            .collect()
    }

    /// Transfer ownership of a finished segment, attaching the mapping
    /// table and the one-shot new-table flag.
    pub fn get_data(&mut self, fov: usize) -> Option<FovSegment> {
        let mut segment = self.outputs[fov].take()?;
        segment.mapping_table = self.mapping_table.clone();
        segment.new_mapping_table = self.new_mapping_table[fov];
        self.new_mapping_table[fov] = false;
        Some(segment)
    }

    /// Load (or reload) the mapping table and pixel mask. Empty paths
    /// fall back to the per-head default locations.
    pub fn reload_calibration_data(
        &mut self,
        mapping_table_path: Option<&Path>,
        pixel_mask_path: Option<&Path>,
    ) {
        let letter = HEAD_LETTERS[self.head_num.min(HEAD_LETTERS.len() - 1)];
        let table_path = mapping_table_path.map(PathBuf::from).unwrap_or_else(|| {
            PathBuf::from(format!("{}{}.bin", MAPPING_TABLE_FILE_ROOT, letter))
        });
        let mask_path = pixel_mask_path.map(PathBuf::from).unwrap_or_else(|| {
            PathBuf::from(format!("{}{}.bin", PIXEL_MASK_FILE_ROOT, letter))
        });

        match MappingTable::load(&table_path) {
            Ok(table) => {
                info!(path = %table_path.display(), records = table.len(), "mapping table loaded");
                self.mapping_table = Some(Arc::new(table));
                self.new_mapping_table = [true; MAX_ACTIVE_FOVS];
            }
            Err(err) => {
                error!(path = %table_path.display(), %err, "unable to load mapping table");
                self.mapping_table = None;
            }
        }

        self.pixel_mask = Arc::new(calibration::load_pixel_mask(&mask_path));
        self.new_pixel_mask = [true; MAX_ACTIVE_FOVS];
    }

    /// Stop every worker thread; call before dropping at shutdown.
    pub fn shutdown(&mut self) {
        for engine in self.engines.iter_mut().flatten() {
            if let Engine::Grid(grid) = engine {
                grid.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{build, default_metadata_words, IMAGE_WIDTH, NUM_PHASES};

    fn full_frame_roi() -> Vec<u8> {
        let mut words = default_metadata_words();
        build::set(&mut words, build::ROI_NUM_ROWS, 20);
        build::set_fov(&mut words, 0, build::FOV_NUM_ROWS, 20);
        let mut bytes = build::to_bytes(&words);
        let payload = 20 * IMAGE_WIDTH * NUM_PHASES * 2 * 3;
        for _ in 0..payload {
            bytes.extend_from_slice(&(150u16 << 4).to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_single_fov_grid_dispatch() {
        let mut fovs = RawToFovs::new(0);
        fovs.process_roi(&full_frame_roi());

        // One ROI covering the whole FOV finalizes immediately.
        for _ in 0..500 {
            if !fovs.fovs_available().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let available = fovs.fovs_available();
        assert_eq!(available, vec![0]);

        let segment = fovs.get_data(0).expect("segment");
        assert_eq!(segment.fov_idx, 0);
        // The flag clears on take.
        assert!(fovs.fovs_available().is_empty());
        assert!(fovs.get_data(0).is_none());
        fovs.shutdown();
    }

    #[test]
    fn test_mode_flip_rebuilds_engine() {
        let mut fovs = RawToFovs::new(0);
        fovs.process_roi(&full_frame_roi());
        assert!(fovs.engines[0].as_ref().unwrap().is_grid());

        // Flip FOV 0 to stripe mode; the engine is reconstructed.
        let mut words = default_metadata_words();
        build::set(&mut words, build::ROI_NUM_ROWS, 6);
        build::set_fov(&mut words, 0, build::FOV_NUM_ROWS, 6);
        build::set_fov(&mut words, 0, build::FOV_ALG_COMMON, build::ALG_COMMON_STRIPE);
        let mut bytes = build::to_bytes(&words);
        let payload = 6 * IMAGE_WIDTH * NUM_PHASES * 2 * 3;
        for _ in 0..payload {
            bytes.extend_from_slice(&(150u16 << 4).to_le_bytes());
        }
        fovs.process_roi(&bytes);
        assert!(!fovs.engines[0].as_ref().unwrap().is_grid());
        fovs.shutdown();
    }

    #[test]
    fn test_new_mapping_table_flag_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let table_path = dir.path().join("table.bin");
        let mut bytes = Vec::new();
        for v in 0..8i32 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&table_path, &bytes).unwrap();

        let mut fovs = RawToFovs::new(0);
        fovs.reload_calibration_data(Some(&table_path), None);

        fovs.process_roi(&full_frame_roi());
        for _ in 0..500 {
            if !fovs.fovs_available().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let segment = fovs.get_data(0).expect("segment");
        assert!(segment.new_mapping_table);
        assert!(segment.mapping_table.is_some());
        fovs.shutdown();
    }
}
