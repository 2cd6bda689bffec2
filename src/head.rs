// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Sensor-head thread plumbing shared by the V4L2 and mock ingest paths.
//!
//! Each head owns an ingest thread driven by one-byte commands over a
//! socketpair: the main thread writes a command and waits (bounded) for
//! the echo ack; the ingest thread drains commands without blocking.
//! Every ROI the ingest produces flows through [`SensorHead::send_roi`]:
//! optional file dump, optional raw network mirror, then the
//! reconstruction engines and the depth streams.

use crate::control::*;
use crate::fovs::RawToFovs;
use crate::mock;
use crate::netwrap::{DepthStream, RawStream, NET_OUTPUT_BASE_PORT};
use crate::timesync::TimeSync;
use crate::v4l2;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Output streams per head: one per FOV slot.
pub const FOV_STREAMS_PER_HEAD: usize = 8;
/// How long the main thread waits for a command acknowledgement.
pub const CONTROL_ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Raw mirror buffering, in ROIs.
const RAW_ROIS_IN_BUFFER: usize = 91;

/// Wait for any of `fds` to become readable. `None` timeout blocks
/// forever. Returns the readable subset; empty on timeout.
pub fn select_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<RawFd>> {
    loop {
        let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut max_fd = 0;
        unsafe {
            libc::FD_ZERO(&mut set);
            for &fd in fds {
                libc::FD_SET(fd, &mut set);
                max_fd = max_fd.max(fd);
            }
        }
        let mut tv = timeout.map(|t| libc::timeval {
            tv_sec: t.as_secs() as libc::time_t,
            tv_usec: t.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);

        let rc = unsafe {
            libc::select(max_fd + 1, &mut set, std::ptr::null_mut(), std::ptr::null_mut(), tv_ptr)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        let ready = fds
            .iter()
            .copied()
            .filter(|&fd| unsafe { libc::FD_ISSET(fd, &set) })
            .collect();
        return Ok(ready);
    }
}

fn write_byte(fd: RawFd, byte: u8) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        return Ok(());
    }
}

fn read_byte(fd: RawFd) -> io::Result<u8> {
    let mut byte = 0u8;
    let rc = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(byte)
}

/// Which acquisition backend drives a head.
pub enum IngestKind {
    V4l2 {
        device_path: String,
        time_sync: Arc<TimeSync>,
        i2c_address: u16,
    },
    Mock {
        prefix: String,
        delay_ms: i64,
    },
}

/// Head configuration shared by both backends.
#[derive(Clone)]
pub struct HeadOptions {
    pub head_num: usize,
    pub out_prefix: Option<String>,
    pub out_max_rois: i32,
    pub cal_path: Option<PathBuf>,
    pub pixmap_path: Option<PathBuf>,
    pub max_net_frames: i32,
    pub base_port: u16,
}

/// Main-thread handle over one sensor-head thread.
pub struct HeadControl {
    trig_fd: RawFd,
    cal_loaded: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    sync_time_request: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HeadControl {
    /// Synchronously execute a thread-level command: send the byte, wait
    /// for the echo. A start command silently promotes to
    /// start-with-reload when calibration has never been loaded.
    pub fn handle_control_byte(&self, byte: u8) {
        let mut byte = byte;
        if byte & THR_COMMAND_MASK == THR_START_STREAMING && !self.cal_loaded.load(Ordering::Acquire)
        {
            byte = THR_START_STREAMING_WITH_RELOAD | (byte & THR_PARAM_MASK);
        }

        if let Err(err) = write_byte(self.trig_fd, byte) {
            error!(%err, "failed to send notification");
            return;
        }

        match select_readable(&[self.trig_fd], Some(CONTROL_ACK_TIMEOUT)) {
            Ok(ready) if ready.is_empty() => {
                error!(timeout = ?CONTROL_ACK_TIMEOUT, "command acknowledgement timed out");
            }
            Ok(_) => match read_byte(self.trig_fd) {
                Ok(ack) if ack == byte => {}
                Ok(ack) => error!(ack, expected = byte, "wrong acknowledgement value"),
                Err(err) => error!(%err, "failure reading command acknowledgement"),
            },
            Err(err) => error!(%err, "select failed while waiting for acknowledgement"),
        }
    }

    /// Ask the thread to exit. The ack is the shutdown notification.
    pub fn exit_thread(&self) {
        let _ = write_byte(self.trig_fd, THR_EXIT_THREAD);
    }

    /// File descriptor the main loop watches for shutdown notifications
    /// (and command acks).
    pub fn trig_fd(&self) -> RawFd {
        self.trig_fd
    }

    pub fn sync_time_on_next_session(&self) {
        info!("time will be synchronized on the next session");
        self.sync_time_request.store(true, Ordering::Release);
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The ingest-thread half of a head.
pub struct SensorHead {
    pub head_num: usize,
    wait_fd: RawFd,
    fovs: RawToFovs,
    depth_streams: Vec<DepthStream>,
    raw_stream: Option<RawStream>,
    raw_streaming_suspended: bool,
    first_raw_roi: bool,
    out_prefix: Option<String>,
    out_max_rois: i32,
    out_session: i32,
    out_roi: i32,
    out_streaming: bool,
    cal_path: Option<PathBuf>,
    pixmap_path: Option<PathBuf>,
    cal_loaded: Arc<AtomicBool>,
}

impl SensorHead {
    pub fn wait_fd(&self) -> RawFd {
        self.wait_fd
    }

    /// Echo a command back to the main thread once it has been executed.
    pub fn ack_control_byte(&self, byte: u8) {
        if let Err(err) = write_byte(self.wait_fd, byte) {
            error!(%err, "failed to ack control byte");
        }
    }

    /// An unsolicited byte on the wait fd tells the main thread this
    /// head has shut down.
    pub fn notify_shutdown(&self) {
        info!(head = self.head_num, "notifying shutdown");
        if let Err(err) = write_byte(self.wait_fd, 0) {
            error!(%err, "shutdown notification failed");
        }
    }

    pub fn reload_calibration_data(&mut self) {
        let cal = self.cal_path.clone();
        let pixmap = self.pixmap_path.clone();
        self.fovs
            .reload_calibration_data(cal.as_deref(), pixmap.as_deref());
        self.cal_loaded.store(true, Ordering::Release);
        info!(head = self.head_num, "calibration data reloaded");
    }

    /// Drain one pending command, executing the side effects common to
    /// both ingest backends. Non-blocking; returns
    /// [`THR_NOTHING_HAPPENED`] when no command is pending.
    pub fn receive_notification(&mut self) -> u8 {
        let note = loop {
            let mut byte = 0u8;
            let rc = unsafe {
                libc::recv(
                    self.wait_fd,
                    &mut byte as *mut u8 as *mut libc::c_void,
                    1,
                    libc::MSG_DONTWAIT,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return THR_NOTHING_HAPPENED,
                    Some(libc::EINTR) => continue,
                    _ => {
                        error!(%err, "failed to receive notification, exiting thread");
                        return THR_EXIT_THREAD;
                    }
                }
            }
            break byte;
        };

        if note == THR_RELOAD_CAL_DATA
            || note & THR_COMMAND_MASK == THR_START_STREAMING_WITH_RELOAD
        {
            self.reload_calibration_data();
        } else if note == THR_START_RAW_STREAMING {
            if self.raw_stream.is_none() {
                info!(head = self.head_num, "starting raw streaming");
                match RawStream::new(self.head_num, RAW_ROIS_IN_BUFFER) {
                    Ok(stream) => self.raw_stream = Some(stream),
                    Err(err) => error!(%err, "unable to start the raw stream"),
                }
            } else {
                info!(head = self.head_num, "raw streaming already running");
            }
            if self.raw_streaming_suspended {
                self.raw_streaming_suspended = false;
                self.first_raw_roi = true;
            }
        } else if note == THR_SUSPEND_RAW_STREAMING {
            self.raw_streaming_suspended = true;
        }

        if self.out_prefix.is_some() && note & THR_COMMAND_MASK == THR_START_STREAMING {
            self.out_session += 1;
            self.out_roi = 0;
            self.out_streaming = true;
        }

        note
    }

    fn dump_roi_to_file(&mut self, roi: &[u8]) {
        let prefix = match &self.out_prefix {
            Some(p) => p,
            None => return,
        };
        let name = format!(
            "{}_{}_{:02}_{:04}.bin",
            prefix, self.head_num, self.out_session, self.out_roi
        );
        debug!(name, "writing raw output file");
        match std::fs::File::create(&name) {
            Ok(mut file) => {
                if let Err(err) = file.write_all(roi) {
                    error!(%err, "cannot write output file");
                }
                self.out_roi += 1;
                if self.out_roi >= self.out_max_rois {
                    self.out_streaming = false;
                }
            }
            Err(err) => {
                error!(name, %err, "cannot open output file, streaming to file disabled");
            }
        }
    }

    fn send_roi(&mut self, roi: &[u8]) {
        if self.out_streaming {
            self.dump_roi_to_file(roi);
        }

        if !self.raw_streaming_suspended {
            if let Some(raw) = self.raw_stream.as_mut() {
                raw.hand_in_roi(roi, self.first_raw_roi);
                self.first_raw_roi = false;
            }
        }

        self.fovs.process_roi(roi);

        for fov in self.fovs.fovs_available() {
            if let Some(segment) = self.fovs.get_data(fov) {
                self.depth_streams[fov].hand_in_depth(&segment);
            }
        }
    }

    /// Feed a (possibly aggregated) frame of capture data, one or more
    /// ROIs back to back.
    pub fn send_mipi_frame(&mut self, data: &[u8], roi_size: usize, num_rois: usize) {
        if data.len() < roi_size * num_rois {
            error!(
                len = data.len(),
                roi_size, num_rois, "short frame buffer, ignoring frame"
            );
            return;
        }
        for roi in 0..num_rois {
            self.send_roi(&data[roi * roi_size..(roi + 1) * roi_size]);
        }
    }

    fn shutdown(&mut self) {
        self.fovs.shutdown();
        for stream in &mut self.depth_streams {
            stream.shutdown();
        }
        if let Some(raw) = &mut self.raw_stream {
            raw.shutdown();
        }
    }
}

/// Create the socketpair, the output streams, and the ingest thread for
/// one head; returns the main-thread control handle.
pub fn spawn_head(ingest: IngestKind, opts: HeadOptions) -> io::Result<HeadControl> {
    let mut socks = [0 as RawFd; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET,
            0,
            socks.as_mut_ptr(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let (wait_fd, trig_fd) = (socks[0], socks[1]);
    debug!(wait_fd, trig_fd, "head control socketpair");

    let base_port = if opts.base_port == 0 {
        NET_OUTPUT_BASE_PORT
    } else {
        opts.base_port
    };
    let mut depth_streams = Vec::with_capacity(FOV_STREAMS_PER_HEAD);
    for fov in 0..FOV_STREAMS_PER_HEAD {
        depth_streams.push(DepthStream::new(
            fov + FOV_STREAMS_PER_HEAD * opts.head_num,
            opts.max_net_frames,
            base_port,
        )?);
    }

    let cal_loaded = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let sync_time_request = Arc::new(AtomicBool::new(true));

    let mut head = SensorHead {
        head_num: opts.head_num,
        wait_fd,
        fovs: RawToFovs::new(opts.head_num),
        depth_streams,
        raw_stream: None,
        raw_streaming_suspended: true,
        first_raw_roi: false,
        out_prefix: opts.out_prefix.clone(),
        out_max_rois: opts.out_max_rois,
        out_session: 0,
        out_roi: 0,
        out_streaming: false,
        cal_path: opts.cal_path.clone(),
        pixmap_path: opts.pixmap_path.clone(),
        cal_loaded: cal_loaded.clone(),
    };

    let sync_request = sync_time_request.clone();
    let thread = thread::Builder::new()
        .name(format!("head-{}", opts.head_num))
        .spawn(move || {
            match ingest {
                IngestKind::V4l2 {
                    device_path,
                    time_sync,
                    i2c_address,
                } => v4l2::run(&mut head, &device_path, &time_sync, i2c_address, &sync_request),
                IngestKind::Mock { prefix, delay_ms } => mock::run(&mut head, &prefix, delay_ms),
            }
            head.shutdown();
            head.notify_shutdown();
        })?;

    Ok(HeadControl {
        trig_fd,
        cal_loaded,
        stopped,
        sync_time_request,
        thread: Some(thread),
    })
}
