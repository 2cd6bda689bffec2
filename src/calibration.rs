// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Calibration artifacts: the angle-to-angle mapping table and the
//! illumination pixel mask.
//!
//! Both are produced at calibration time by system control and dropped
//! on the filesystem. A missing mapping table leaves the sensor running
//! without angular calibration (no Type-C update goes out); a missing
//! pixel mask defaults to fully permissive.

use crate::metadata::{IMAGE_WIDTH, MAX_IMAGE_HEIGHT};
use ndarray::Array2;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, error};

/// The mapping table is a dense (2*640-1) x (2*480-1) grid.
pub const MAPPING_TABLE_WIDTH: usize = IMAGE_WIDTH * 2 - 1;
pub const MAPPING_TABLE_HEIGHT: usize = MAX_IMAGE_HEIGHT * 2 - 1;
pub const MAPPING_TABLE_LENGTH: usize = MAPPING_TABLE_WIDTH * MAPPING_TABLE_HEIGHT;

#[derive(Debug)]
pub enum CalibrationError {
    Io(std::io::Error),
    /// CSV cell missing or unparsable at the given record.
    BadRecord(usize),
}

impl std::error::Error for CalibrationError {}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CalibrationError::Io(err) => write!(f, "calibration io error: {}", err),
            CalibrationError::BadRecord(idx) => write!(f, "bad calibration record {}", idx),
        }
    }
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::Io(err)
    }
}

/// Sensor-index to angle-angle calibration, four channels per record.
pub struct MappingTable {
    pub x: Vec<i32>,
    pub y: Vec<i32>,
    pub theta: Vec<i32>,
    pub phi: Vec<i32>,
}

impl MappingTable {
    /// Load from `.bin` (packed records of four little-endian `i32`:
    /// x, y, theta, phi in arc-seconds) or from CSV with the same
    /// columns, selected by extension.
    pub fn load(path: &Path) -> Result<MappingTable, CalibrationError> {
        debug!(path = %path.display(), "loading mapping table");
        let file = File::open(path)?;
        if path.extension().is_some_and(|e| e == "bin") {
            Self::load_bin(file)
        } else {
            Self::load_csv(file)
        }
    }

    fn load_bin(file: File) -> Result<MappingTable, CalibrationError> {
        let mut table = MappingTable {
            x: Vec::with_capacity(MAPPING_TABLE_LENGTH),
            y: Vec::with_capacity(MAPPING_TABLE_LENGTH),
            theta: Vec::with_capacity(MAPPING_TABLE_LENGTH),
            phi: Vec::with_capacity(MAPPING_TABLE_LENGTH),
        };
        let mut reader = BufReader::new(file);
        let mut record = [0u8; 16];
        while table.x.len() < MAPPING_TABLE_LENGTH {
            match reader.read_exact(&mut record) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let val = |i: usize| {
                i32::from_le_bytes([record[4 * i], record[4 * i + 1], record[4 * i + 2], record[4 * i + 3]])
            };
            table.x.push(val(0));
            table.y.push(val(1));
            table.theta.push(val(2));
            table.phi.push(val(3));
        }
        Ok(table)
    }

    fn load_csv(file: File) -> Result<MappingTable, CalibrationError> {
        let mut table = MappingTable {
            x: Vec::with_capacity(MAPPING_TABLE_LENGTH),
            y: Vec::with_capacity(MAPPING_TABLE_LENGTH),
            theta: Vec::with_capacity(MAPPING_TABLE_LENGTH),
            phi: Vec::with_capacity(MAPPING_TABLE_LENGTH),
        };
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let mut cells = line.split(',');
            let mut next = || -> Result<i32, CalibrationError> {
                cells
                    .next()
                    .and_then(|c| c.trim().parse().ok())
                    .ok_or(CalibrationError::BadRecord(idx))
            };
            table.x.push(next()?);
            table.y.push(next()?);
            table.theta.push(next()?);
            table.phi.push(next()?);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Re-emit one record as the four packed little-endian `i32`s of the
    /// `.bin` format.
    pub fn record_bytes(&self, idx: usize) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.x[idx].to_le_bytes());
        out[4..8].copy_from_slice(&self.y[idx].to_le_bytes());
        out[8..12].copy_from_slice(&self.theta[idx].to_le_bytes());
        out[12..16].copy_from_slice(&self.phi[idx].to_le_bytes());
        out
    }
}

/// 640x480 illumination mask: zero marks a pixel outside the illuminated
/// region. The default is fully permissive.
pub fn default_pixel_mask() -> Array2<u16> {
    Array2::from_elem((MAX_IMAGE_HEIGHT, IMAGE_WIDTH), 0xffff)
}

/// Load the pixel mask; any failure falls back to the permissive default.
pub fn load_pixel_mask(path: &Path) -> Array2<u16> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
            debug!(path = %path.display(), %err, "pixel mask unavailable, defaulting to passthrough");
            return default_pixel_mask();
        }
    };

    let mut bytes = vec![0u8; IMAGE_WIDTH * MAX_IMAGE_HEIGHT * 2];
    if let Err(err) = file.read_exact(&mut bytes) {
        error!(path = %path.display(), %err, "pixel mask truncated, defaulting to passthrough");
        return default_pixel_mask();
    }

    let words: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Array2::from_shape_vec((MAX_IMAGE_HEIGHT, IMAGE_WIDTH), words)
        .unwrap_or_else(|_| default_pixel_mask())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bin_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.bin");

        let mut bytes = Vec::new();
        for i in 0..10i32 {
            for v in [i, -i, i * 3600, -i * 3600] {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        std::fs::write(&path, &bytes).unwrap();

        let table = MappingTable::load(&path).unwrap();
        assert_eq!(table.len(), 10);
        // Re-emitting each record reproduces the input byte-for-byte.
        let mut out = Vec::new();
        for i in 0..table.len() {
            out.extend_from_slice(&table.record_bytes(i));
        }
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_csv_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "1,2,3,4").unwrap();
        writeln!(f, "5,6,7,8").unwrap();
        drop(f);

        let table = MappingTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.theta, vec![3, 7]);
        assert_eq!(table.phi, vec![4, 8]);
    }

    #[test]
    fn test_csv_bad_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        std::fs::write(&path, "1,2,nope,4\n").unwrap();
        assert!(MappingTable::load(&path).is_err());
    }

    #[test]
    fn test_missing_pixel_mask_is_permissive() {
        let mask = load_pixel_mask(Path::new("/nonexistent/pixel_mask.bin"));
        assert_eq!(mask.dim(), (MAX_IMAGE_HEIGHT, IMAGE_WIDTH));
        assert!(mask.iter().all(|&v| v != 0));
    }

    #[test]
    fn test_pixel_mask_loads_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.bin");
        let mut words = vec![1u16; IMAGE_WIDTH * MAX_IMAGE_HEIGHT];
        words[0] = 0;
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for w in &words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();

        let mask = load_pixel_mask(&path);
        assert_eq!(mask[(0, 0)], 0);
        assert_eq!(mask[(0, 1)], 1);
    }
}
