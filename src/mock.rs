// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Mock ingest: replay raw ROI files captured from a live sensor.
//!
//! Files are named `<prefix>NNNN.bin` with a four-digit decimal
//! sequence starting at 0000. Replay walks the sequence, wraps to 0000
//! at the first gap, and paces ROIs with a configurable delay. A
//! missing 0000 file is fatal to the thread (bad prefix).

use crate::control::{THR_EXIT_THREAD, THR_NOTHING_HAPPENED};
use crate::head::SensorHead;
use crate::metadata::{MD_ROW_BYTES, ROI_SIZE};
use std::io::Read;
use std::time::Duration;
use tracing::{error, info, warn};

fn file_name(prefix: &str, num: u32) -> String {
    format!("{}{:04}.bin", prefix, num)
}

/// Resolve the next existing file in the sequence, wrapping once at a
/// gap. `None` means even 0000 is missing.
fn next_existing(prefix: &str, num: u32) -> Option<(String, u32, u64)> {
    let mut num = num;
    loop {
        let name = file_name(prefix, num);
        match std::fs::metadata(&name) {
            Ok(meta) => return Some((name, num, meta.len())),
            Err(_) if num != 0 => num = 0, // wrap and retry from the top
            Err(_) => {
                error!(prefix, name, "no files with the specified prefix");
                return None;
            }
        }
    }
}

fn send_frame_from_file(head: &mut SensorHead, name: &str, size: u64, frame: &mut Vec<u8>) {
    let mut size = size as usize;
    if size > frame.capacity() {
        warn!(
            name,
            size,
            max = frame.capacity(),
            "mock file too big for buffer, ignoring excess"
        );
        size = frame.capacity();
    }
    if size < MD_ROW_BYTES {
        warn!(name, size, "mock file too small for metadata, skipping");
        return;
    }

    let mut file = match std::fs::File::open(name) {
        Ok(f) => f,
        Err(err) => {
            warn!(name, %err, "cannot open mock file, skipping");
            return;
        }
    };
    frame.resize(size, 0);
    if let Err(err) = file.read_exact(frame) {
        warn!(name, %err, "cannot read mock file, skipping");
        return;
    }

    head.send_mipi_frame(frame, size, 1);
}

/// The mock ingest main loop. Returns when told to exit or when the
/// file prefix turns out to be unusable.
pub fn run(head: &mut SensorHead, prefix: &str, delay_ms: i64) {
    let mut num = 0u32;
    let mut frame: Vec<u8> = Vec::with_capacity(ROI_SIZE);

    // Mock heads have no driver handshake; load calibration up front.
    head.reload_calibration_data();

    loop {
        let note = head.receive_notification();
        if note == THR_EXIT_THREAD {
            info!("mock ingest exiting");
            return;
        }
        if note != THR_NOTHING_HAPPENED {
            head.ack_control_byte(note);
        }

        if delay_ms < 0 {
            // Replay disabled until a delay is configured; idle politely.
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms as u64));
        }

        match next_existing(prefix, num) {
            Some((name, found, size)) => {
                send_frame_from_file(head, &name, size, &mut frame);
                num = found + 1;
            }
            None => {
                info!("mock ingest shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_name_zero_padding() {
        assert_eq!(file_name("/tmp/roi_", 0), "/tmp/roi_0000.bin");
        assert_eq!(file_name("/tmp/roi_", 123), "/tmp/roi_0123.bin");
    }

    #[test]
    fn test_sequence_wraps_at_gap() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("roi_").to_string_lossy().into_owned();
        for num in 0..3u32 {
            let mut f = std::fs::File::create(file_name(&prefix, num)).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }

        // Walk 0, 1, 2; at 3 the sequence wraps to 0.
        let (_, found, _) = next_existing(&prefix, 2).unwrap();
        assert_eq!(found, 2);
        let (_, found, _) = next_existing(&prefix, 3).unwrap();
        assert_eq!(found, 0);
    }

    #[test]
    fn test_missing_first_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("nothing_").to_string_lossy().into_owned();
        assert!(next_existing(&prefix, 0).is_none());
    }
}
