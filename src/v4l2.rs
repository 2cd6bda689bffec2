// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! V4L2 ingest: the live MIPI capture path.
//!
//! The capture device is opened once (with retries) and checked against
//! the fixed mode table; a streaming session sets the format and frame
//! rate, maps a ring of buffers, and then multiplexes between the video
//! fd and the control socket with `select`. Dequeued frames are scanned
//! for dropped ROIs, their timestamps shifted to UTC in place, and
//! handed to the reconstruction path.

use crate::affinity;
use crate::control::*;
use crate::head::{select_readable, SensorHead};
use crate::metadata::{self, Metadata, MAX_ACTIVE_FOVS};
use crate::timesync::TimeSync;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

/// One streaming mode the driver must support.
struct ModeInfo {
    width: u32,
    height: u32,
    fps: u32,
    roi_size: usize,
    num_rois: usize,
    name: &'static str,
}

/// The fixed table of capture modes, selected by the low nibble of the
/// start-streaming command.
static MODES: [ModeInfo; 10] = [
    ModeInfo { width: 1280, height: 2881, fps: 10, roi_size: 11_063_040, num_rois: 1, name: "DMFD_FF_BGR888" },
    ModeInfo { width: 1280, height: 121, fps: 637, roi_size: 464_640, num_rois: 1, name: "DMFD_20_BGR888" },
    ModeInfo { width: 1280, height: 41, fps: 637, roi_size: 157_440, num_rois: 1, name: "TA_20_BGR888" },
    ModeInfo { width: 1280, height: 410, fps: 64, roi_size: 157_440, num_rois: 10, name: "TA_20_AG_10_BGR888" },
    ModeInfo { width: 1280, height: 49, fps: 819, roi_size: 188_160, num_rois: 1, name: "DMFD_8_BGR888" },
    ModeInfo { width: 1280, height: 17, fps: 819, roi_size: 65_280, num_rois: 1, name: "TA_8_BGR888" },
    ModeInfo { width: 1280, height: 170, fps: 82, roi_size: 65_280, num_rois: 10, name: "TA_8_AG_10_BGR888" },
    ModeInfo { width: 1280, height: 37, fps: 910, roi_size: 142_080, num_rois: 1, name: "DMFD_6_BGR888" },
    ModeInfo { width: 1280, height: 13, fps: 910, roi_size: 49_920, num_rois: 1, name: "TA_6_BGR888" },
    ModeInfo { width: 1280, height: 130, fps: 91, roi_size: 49_920, num_rois: 10, name: "TA_6_AG_10_BGR888" },
];

const NUM_V4L_BUFFERS: u32 = 32;
const NUM_ALLOWED_OPEN_FAILURES: u32 = 10;
const FRAME_DROP_REPORTING_INTERVAL: u64 = 10_000;
const PIXEL_FORMAT: &[u8; 4] = b"BGR3";

struct DropCounters {
    seq_num: i64,
    frame_count: u64,
    dropped: u64,
    drop_events: u64,
}

impl DropCounters {
    fn new() -> DropCounters {
        DropCounters {
            seq_num: -1,
            frame_count: 0,
            dropped: 0,
            drop_events: 0,
        }
    }

    fn report(&mut self) {
        if self.drop_events != 0 {
            warn!(
                dropped = self.dropped,
                events = self.drop_events,
                received = self.frame_count,
                "ROI frame(s) were dropped"
            );
        }
        self.frame_count = 0;
        self.dropped = 0;
        self.drop_events = 0;
    }

    /// Track the metadata ROI counter: stream start and wraparound to
    /// zero are ignored, regressions count one drop, forward gaps count
    /// their size.
    fn track(&mut self, seq: i64) {
        if self.seq_num != seq {
            if seq > 0 && self.seq_num >= 0 {
                if seq <= self.seq_num {
                    info!(seq, expected = self.seq_num, "weird ROI counter sequence");
                    self.dropped += 1;
                } else {
                    self.dropped += (seq - self.seq_num) as u64;
                }
                self.drop_events += 1;
                debug!(seq, expected = self.seq_num, "frame drop");
            }
            self.seq_num = seq;
        }
        self.seq_num += 1;
        self.frame_count += 1;
        if self.frame_count >= FRAME_DROP_REPORTING_INTERVAL {
            self.report();
        }
    }
}

/// Open the capture device, retrying, and verify it supports every
/// entry of the mode table.
fn open_device(device_path: &str) -> Option<Device> {
    let mut device = None;
    for attempt in 0..NUM_ALLOWED_OPEN_FAILURES {
        match Device::with_path(device_path) {
            Ok(dev) => {
                info!(device = device_path, "video device opened");
                device = Some(dev);
                break;
            }
            Err(err) => {
                info!(device = device_path, %err, attempt, "failed to open video device, trying again");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
    let device = device?;

    for mode in &MODES {
        let requested = Format::new(mode.width, mode.height, FourCC::new(PIXEL_FORMAT));
        info!(width = mode.width, height = mode.height, name = mode.name, "probing video mode");
        let actual = match device.set_format(&requested) {
            Ok(actual) => actual,
            Err(err) => {
                error!(%err, name = mode.name, "cannot set video format, your kernel could be out of date");
                return None;
            }
        };
        if actual.width != mode.width || actual.height != mode.height {
            error!(
                expected_width = mode.width,
                expected_height = mode.height,
                actual_width = actual.width,
                actual_height = actual.height,
                "video mode mismatch, your kernel could be out of date"
            );
            return None;
        }
    }
    info!(modes = MODES.len(), "all expected video modes present in driver");
    Some(device)
}

enum SessionEnd {
    Exit,
    Stopped,
    Restart { mode: usize, note: u8 },
}

struct TimeState {
    offset: u64,
}

/// Dequeue one frame, run drop detection and timestamp adjustment, and
/// dispatch it. The mmap buffer is copied out so the metadata can be
/// rewritten without touching the driver's memory.
fn retrieve_and_send(
    head: &mut SensorHead,
    stream: &mut MmapStream,
    mode: &ModeInfo,
    drops: &mut DropCounters,
    time: &TimeState,
    last_user_tags: &mut [i32; MAX_ACTIVE_FOVS],
    scratch: &mut Vec<u8>,
) {
    let (buf, meta) = match stream.next() {
        Ok(frame) => frame,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::WouldBlock {
                error!(%err, "failed to dequeue buffer");
            }
            return;
        }
    };
    if meta.flags.contains(v4l::buffer::Flags::ERROR) {
        return;
    }

    let frame_bytes = mode.roi_size * mode.num_rois;
    if buf.len() < frame_bytes {
        error!(
            length = buf.len(),
            roi_size = mode.roi_size,
            num_rois = mode.num_rois,
            "capture buffer too small"
        );
        return;
    }

    scratch.clear();
    scratch.extend_from_slice(&buf[..frame_bytes]);

    for roi in 0..mode.num_rois {
        let roi_bytes = &mut scratch[roi * mode.roi_size..(roi + 1) * mode.roi_size];
        if let Ok(mdat) = Metadata::new(roi_bytes) {
            drops.track(i64::from(mdat.roi_counter()));

            for (fov, last_tag) in last_user_tags.iter_mut().enumerate() {
                let tag = i32::from(mdat.user_tag(fov));
                if tag != *last_tag {
                    if *last_tag > 0 {
                        info!(fov, old_tag = *last_tag, new_tag = tag, "user tag changed");
                    }
                    *last_tag = tag;
                }
            }
        }
        metadata::adjust_timestamp(roi_bytes, time.offset);
    }

    head.send_mipi_frame(scratch, mode.roi_size, mode.num_rois);
}

/// One streaming session: configure, map, and pump until something ends
/// it. The start command is acknowledged up front so the main thread is
/// not held for the duration of the setup.
#[allow(clippy::too_many_arguments)]
fn run_session(
    head: &mut SensorHead,
    device: &mut Device,
    mode_idx: usize,
    note: u8,
    time_sync: &TimeSync,
    i2c_address: u16,
    sync_request: &AtomicBool,
    time: &mut TimeState,
) -> SessionEnd {
    head.ack_control_byte(note);

    if sync_request.load(Ordering::Acquire) && time_sync.initialized() {
        time.offset = time_sync.sync_time(i2c_address);
        sync_request.store(false, Ordering::Release);
        info!(offset = time.offset, head = head.head_num, "time synchronized");
    }

    let mode = &MODES[mode_idx];
    let format = Format::new(mode.width, mode.height, FourCC::new(PIXEL_FORMAT));
    debug!(
        name = mode.name,
        width = mode.width,
        height = mode.height,
        "starting session"
    );
    if let Err(err) = device.set_format(&format) {
        error!(%err, "cannot set video format, exiting session");
        return SessionEnd::Stopped;
    }
    let params = v4l::video::capture::Parameters::with_fps(mode.fps);
    if let Err(err) = device.set_params(&params) {
        error!(%err, "cannot set frame rate, exiting session");
        return SessionEnd::Stopped;
    }

    let video_fd = device.handle().fd();
    let mut stream = match MmapStream::with_buffers(device, Type::VideoCapture, NUM_V4L_BUFFERS) {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to map capture buffers, exiting session");
            return SessionEnd::Stopped;
        }
    };

    let wait_fd = head.wait_fd();
    let mut drops = DropCounters::new();
    let mut last_user_tags = [-1i32; MAX_ACTIVE_FOVS];
    let mut scratch = Vec::with_capacity(mode.roi_size * mode.num_rois);

    let end = loop {
        let ready = match select_readable(&[wait_fd, video_fd], None) {
            Ok(ready) => ready,
            Err(err) => {
                error!(%err, "select failed, exiting session");
                break SessionEnd::Exit;
            }
        };

        if ready.contains(&video_fd) {
            retrieve_and_send(
                head,
                &mut stream,
                mode,
                &mut drops,
                time,
                &mut last_user_tags,
                &mut scratch,
            );
        }

        if ready.contains(&wait_fd) {
            let note = head.receive_notification();
            match note {
                THR_NOTHING_HAPPENED => {}
                THR_EXIT_THREAD => break SessionEnd::Exit,
                THR_STOP_STREAMING => {
                    info!("stop streaming");
                    head.ack_control_byte(note);
                    break SessionEnd::Stopped;
                }
                _ if note & THR_COMMAND_MASK == THR_START_STREAMING
                    || note & THR_COMMAND_MASK == THR_START_STREAMING_WITH_RELOAD =>
                {
                    let mode = usize::from(note & THR_PARAM_MASK);
                    if mode < MODES.len() {
                        break SessionEnd::Restart { mode, note };
                    }
                    error!(format = mode, max = MODES.len(), "unknown video mode");
                    head.ack_control_byte(note);
                }
                other => head.ack_control_byte(other),
            }
        }
    };

    drops.report();
    end
}

/// The live ingest main loop: idle waiting for commands, streaming in
/// sessions.
pub fn run(
    head: &mut SensorHead,
    device_path: &str,
    time_sync: &TimeSync,
    i2c_address: u16,
    sync_request: &AtomicBool,
) {
    affinity::pin_to_big_core(1);

    let mut device = match open_device(device_path) {
        Some(device) => device,
        None => return,
    };
    let mut time = TimeState { offset: 0 };

    // Idle loop: no stream, just commands.
    let mut pending_start: Option<(usize, u8)> = None;
    loop {
        let (mode, note) = match pending_start.take() {
            Some(start) => start,
            None => {
                match select_readable(&[head.wait_fd()], None) {
                    Ok(_) => {}
                    Err(err) => {
                        error!(%err, "select failed, exiting thread");
                        return;
                    }
                }
                let note = head.receive_notification();
                match note {
                    THR_NOTHING_HAPPENED => continue,
                    THR_EXIT_THREAD => {
                        info!("exit requested");
                        return;
                    }
                    _ if note & THR_COMMAND_MASK == THR_START_STREAMING
                        || note & THR_COMMAND_MASK == THR_START_STREAMING_WITH_RELOAD =>
                    {
                        let mode = usize::from(note & THR_PARAM_MASK);
                        if mode >= MODES.len() {
                            error!(format = mode, max = MODES.len(), "unknown video mode");
                            head.ack_control_byte(note);
                            continue;
                        }
                        (mode, note)
                    }
                    other => {
                        head.ack_control_byte(other);
                        continue;
                    }
                }
            }
        };

        info!(device = device_path, format = mode, "start streaming");
        match run_session(
            head,
            &mut device,
            mode,
            note,
            time_sync,
            i2c_address,
            sync_request,
            &mut time,
        ) {
            SessionEnd::Exit => return,
            SessionEnd::Stopped => {}
            SessionEnd::Restart { mode, note } => pending_start = Some((mode, note)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_table_consistency() {
        // The aggregate modes carry ten ROIs whose per-ROI size matches
        // the matching single-ROI mode.
        assert_eq!(MODES[3].roi_size, MODES[2].roi_size);
        assert_eq!(MODES[3].num_rois, 10);
        assert_eq!(MODES[6].roi_size, MODES[5].roi_size);
        assert_eq!(MODES[9].roi_size, MODES[8].roi_size);
        // The 20-row tap-accumulated ROI is the canonical wire size.
        assert_eq!(MODES[2].roi_size, crate::metadata::ROI_SIZE);
    }

    #[test]
    fn test_drop_counter_rules() {
        let mut drops = DropCounters::new();
        // Stream start: first sequence is accepted silently.
        drops.track(5);
        assert_eq!(drops.dropped, 0);
        // In-order advance.
        drops.track(6);
        assert_eq!(drops.dropped, 0);
        // A gap of 3 counts its size.
        drops.track(10);
        assert_eq!(drops.dropped, 3);
        assert_eq!(drops.drop_events, 1);
        // Wraparound to zero is ignored.
        drops.track(0);
        assert_eq!(drops.dropped, 3);
        // A regression counts one drop.
        drops.track(1);
        drops.track(1);
        assert_eq!(drops.dropped, 4);
        assert_eq!(drops.drop_events, 2);
    }
}
