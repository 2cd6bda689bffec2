// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! High dynamic range merge.
//!
//! The sensor may re-acquire a saturated ROI at reduced exposure and mark
//! the retake in its metadata. A two-slot delay line holds each ROI for
//! one cycle so a retake can be merged per-pixel with the original; HDR
//! disabled (saturation threshold at maximum) passes ROIs straight
//! through with no latency.

use crate::dsp;
use crate::metadata::{Metadata, INPUT_RAW_SHIFT, MD_ROW_BYTES, RAW_PIXEL_MASK};

pub struct Hdr {
    previous: usize,
    next: usize,
    rois: [Vec<f32>; 2],
    md: [Vec<u8>; 2],
    previous_was_corrected: bool,
    skip: bool,
}

impl Default for Hdr {
    fn default() -> Self {
        Self::new()
    }
}

impl Hdr {
    pub fn new() -> Self {
        Hdr {
            previous: 0,
            next: 1,
            rois: [Vec::new(), Vec::new()],
            md: [Vec::new(), Vec::new()],
            previous_was_corrected: false,
            skip: false,
        }
    }

    /// True when the submitted ROI is being held back for one cycle and
    /// nothing is ready to read out.
    pub fn skip(&self) -> bool {
        self.skip
    }

    /// The ROI ready for processing, as floats, shifted and masked.
    pub fn roi(&self) -> &[f32] {
        &self.rois[self.next]
    }

    /// Metadata row matching [`Hdr::roi`]; time-delayed alongside it.
    pub fn metadata_bytes(&self) -> &[u8] {
        &self.md[self.next]
    }

    fn realloc(&mut self, payload_floats: usize) {
        let changed = self.rois[0].len() != payload_floats;
        if changed {
            self.rois[0] = vec![0.0; payload_floats];
            self.rois[1] = vec![0.0; payload_floats];
            self.previous_was_corrected = false;
            self.skip = true;
        }
        if self.md[0].len() != MD_ROW_BYTES {
            self.md[0] = vec![0; MD_ROW_BYTES];
            self.md[1] = vec![0; MD_ROW_BYTES];
        }
    }

    /// Feed one raw ROI (metadata row first). `startup` is true until the
    /// first ROI ever has passed through the caller.
    pub fn submit(&mut self, roi: &[u8], startup: bool) {
        let mdat = match Metadata::new(roi) {
            Ok(m) => m,
            Err(_) => return,
        };
        let payload = &roi[MD_ROW_BYTES..];
        let payload_floats = payload.len() / 2;

        self.realloc(payload_floats);
        self.skip = false;

        if mdat.hdr_disabled() {
            // Straight pass-through, no pipeline delay.
            self.previous_was_corrected = false;
            dsp::sh2f(
                payload,
                &mut self.rois[self.next],
                INPUT_RAW_SHIFT,
                RAW_PIXEL_MASK,
            );
            self.md[self.next].copy_from_slice(&roi[..MD_ROW_BYTES]);
            return;
        }

        if startup || self.previous_was_corrected {
            // First ROI ever, or first following a merge: prime both
            // slots and add one ROI of latency.
            self.skip = true;
            self.previous_was_corrected = false;
            for slot in [self.previous, self.next] {
                dsp::sh2f(payload, &mut self.rois[slot], INPUT_RAW_SHIFT, RAW_PIXEL_MASK);
                self.md[slot].copy_from_slice(&roi[..MD_ROW_BYTES]);
            }
            return;
        }

        if !mdat.was_previous_roi_saturated() {
            // Emit the held ROI, hold this one.
            self.previous_was_corrected = false;
            std::mem::swap(&mut self.previous, &mut self.next);
            dsp::sh2f(
                payload,
                &mut self.rois[self.previous],
                INPUT_RAW_SHIFT,
                RAW_PIXEL_MASK,
            );
            self.md[self.previous].copy_from_slice(&roi[..MD_ROW_BYTES]);
            return;
        }

        // Retake: merge against the held original, per pixel.
        self.hdr_sum(mdat.saturation_threshold(), payload);
        let prev_md = self.md[self.previous].clone();
        self.md[self.next].copy_from_slice(&prev_md);
        self.previous_was_corrected = true;
    }

    fn hdr_sum(&mut self, saturation_level: u16, payload: &[u8]) {
        let threshold = f32::from(saturation_level >> INPUT_RAW_SHIFT);
        let (prev, next) = if self.previous == 0 {
            let (a, b) = self.rois.split_at_mut(1);
            (&a[0], &mut b[0])
        } else {
            let (a, b) = self.rois.split_at_mut(1);
            (&b[0], &mut a[0])
        };

        for idx in (0..prev.len()).step_by(3) {
            let a = prev[idx];
            let b = prev[idx + 1];
            let c = prev[idx + 2];
            let prev_max = a.max(b).max(c);

            if prev_max >= threshold {
                // Saturated: take the re-acquired triple.
                for comp in 0..3 {
                    let word = u16::from_le_bytes([
                        payload[2 * (idx + comp)],
                        payload[2 * (idx + comp) + 1],
                    ]);
                    next[idx + comp] = f32::from((word & RAW_PIXEL_MASK) >> INPUT_RAW_SHIFT);
                }
            } else {
                next[idx] = a;
                next[idx + 1] = b;
                next[idx + 2] = c;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{build, default_metadata_words, SATURATION_THRESHOLD_DISABLED};

    const ROWS: u16 = 6;

    fn make_roi(saturation: u16, retry: bool, fill: u16) -> Vec<u8> {
        let mut words = default_metadata_words();
        build::set(&mut words, build::ROI_NUM_ROWS, ROWS);
        build::set(&mut words, build::SATURATION_THRESHOLD, saturation);
        if retry {
            build::set(&mut words, build::SENSOR_MODE, build::MODE_HDR_RETRY);
        }
        let mut bytes = build::to_bytes(&words);
        let payload_words = ROWS as usize * 640 * 3 * 2;
        for _ in 0..payload_words {
            bytes.extend_from_slice(&(fill << 2).to_le_bytes());
        }
        bytes
    }

    fn expected(fill: u16) -> f32 {
        f32::from(((fill << 2) & RAW_PIXEL_MASK) >> INPUT_RAW_SHIFT)
    }

    #[test]
    fn test_disabled_passthrough_no_latency() {
        let mut hdr = Hdr::new();
        let r1 = make_roi(SATURATION_THRESHOLD_DISABLED, false, 100);
        let r2 = make_roi(SATURATION_THRESHOLD_DISABLED, false, 200);

        hdr.submit(&r1, true);
        assert!(!hdr.skip());
        assert_eq!(hdr.roi()[0], expected(100));

        hdr.submit(&r2, false);
        assert!(!hdr.skip());
        assert_eq!(hdr.roi()[0], expected(200));
    }

    #[test]
    fn test_enabled_one_roi_latency() {
        let mut hdr = Hdr::new();
        let r1 = make_roi(1000, false, 100);
        let r2 = make_roi(1000, false, 200);

        hdr.submit(&r1, true);
        assert!(hdr.skip());

        // Second non-retake ROI releases the first.
        hdr.submit(&r2, false);
        assert!(!hdr.skip());
        assert_eq!(hdr.roi()[0], expected(100));
    }

    #[test]
    fn test_retake_merges_saturated_pixels() {
        let mut hdr = Hdr::new();
        // Threshold 100 (scaled x3 x2 = 600 on the wire, 300 after the
        // ingest shift); the original fill of 500 raw counts saturates.
        let original = make_roi(100, false, 500);
        let retake = make_roi(100, true, 50);

        hdr.submit(&original, true);
        assert!(hdr.skip());

        hdr.submit(&retake, false);
        assert!(!hdr.skip());
        // Every pixel saturated, so the retake replaces them all.
        assert_eq!(hdr.roi()[0], expected(50));
        // Metadata rides along from the original acquisition.
        let md = Metadata::new(hdr.metadata_bytes()).unwrap();
        assert!(!md.was_previous_roi_saturated());
    }

    #[test]
    fn test_retake_keeps_unsaturated_pixels() {
        let mut hdr = Hdr::new();
        // High threshold: nothing saturates, merge keeps the original.
        let original = make_roi(3000, false, 100);
        let retake = make_roi(3000, true, 50);

        hdr.submit(&original, true);
        hdr.submit(&retake, false);
        assert!(!hdr.skip());
        assert_eq!(hdr.roi()[0], expected(100));
    }

    #[test]
    fn test_latency_after_merge() {
        let mut hdr = Hdr::new();
        hdr.submit(&make_roi(100, false, 500), true);
        hdr.submit(&make_roi(100, true, 50), false);
        assert!(!hdr.skip());

        // The cycle after a merge re-primes and holds again.
        hdr.submit(&make_roi(100, false, 70), false);
        assert!(hdr.skip());
    }
}
