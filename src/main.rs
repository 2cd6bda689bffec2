// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The depth publisher front end.
//!
//! The main thread owns the control-port server: it spawns one sensor
//! head thread per head (live V4L2 or mock replay), then multiplexes
//! between the control listener, the signal self-pipe, and the heads'
//! notification sockets until every head has shut down.

use clap::Parser as _;
use edgefirst_depthpub::args::Args;
use edgefirst_depthpub::control::{
    decode_control_byte, head_number, ControlCommand, FEC_ERROR,
};
use edgefirst_depthpub::head::{select_readable, spawn_head, HeadControl, HeadOptions, IngestKind};
use edgefirst_depthpub::timesync::{StartupMode, TimeSync};
use std::io::{Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt as _, reload, Layer as _, Registry};

/// The NCB drives a single head.
const MAX_HEADS: usize = 1;
/// Capture device shared by the heads.
const VIDEO_DEVICE: u32 = 3;
/// Sensor head FPGAs sit at 0x10, 0x12, ... on the i2c bus.
const BASE_FPGA_I2C_ADDR: u16 = 0x10;
/// Reads on an accepted control connection time out quickly.
const CONTROL_READ_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default number of raw output ROIs per session.
const DEFAULT_MAX_ROIS: i32 = 91;

static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(signal: libc::c_int) {
    if signal == libc::SIGTERM || signal == libc::SIGINT {
        let fd = SIGNAL_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let zero = 0u8;
            unsafe {
                libc::write(fd, &zero as *const u8 as *const libc::c_void, 1);
            }
        }
    }
}

/// Install the SIGINT/SIGTERM self-pipe; returns the fd the main loop
/// watches for shutdown.
fn set_up_signals() -> std::io::Result<RawFd> {
    let mut socks = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, socks.as_mut_ptr()) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    SIGNAL_FD.store(socks[0], Ordering::Relaxed);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as usize;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
    Ok(socks[1])
}

type LevelHandle = reload::Handle<tracing::level_filters::LevelFilter, Registry>;

/// Service one accepted control connection: read a single command byte,
/// execute it synchronously, echo it back.
fn handle_accept(mut stream: TcpStream, heads: &[HeadControl], level: &LevelHandle) {
    if let Err(err) = stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT)) {
        error!(%err, "cannot set control read timeout");
        return;
    }

    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(1) => {}
        Ok(_) => {
            error!("control connection closed without a command");
            return;
        }
        Err(err) => {
            error!(%err, "control read failed");
            return;
        }
    }
    let mut echo = byte[0];

    match decode_control_byte(byte[0]) {
        ControlCommand::SetLogLevel(offset) => {
            // Offsets step from info toward more verbose output.
            let filter = match offset {
                0 => tracing::level_filters::LevelFilter::INFO,
                _ => tracing::level_filters::LevelFilter::DEBUG,
            };
            if level.reload(filter).is_ok() {
                info!(?filter, "log level changed");
            }
        }
        ControlCommand::SyncTime => {
            let head = head_number(byte[0]);
            if head < heads.len() {
                heads[head].sync_time_on_next_session();
            } else {
                echo = FEC_ERROR;
            }
        }
        ControlCommand::Thread(thread_byte) => {
            let head = head_number(byte[0]);
            info!(byte = byte[0], head, "control command received");
            if head < heads.len() {
                // The head executes the command before the byte echoes.
                heads[head].handle_control_byte(thread_byte);
            } else {
                error!(head, max = heads.len(), "command for a head that does not exist");
                echo = FEC_ERROR;
            }
        }
    }

    let _ = stream.write_all(&[echo]);
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

fn drain_fd(fd: RawFd) {
    let mut byte = 0u8;
    unsafe {
        libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (level_filter, level_handle) = reload::Layer::new(args.rust_log);
    let stdout_log = tracing_subscriber::fmt::layer().with_filter(level_filter);
    let journald = tracing_journald::layer()
        .ok()
        .map(|layer| layer.with_filter(args.rust_log));
    let subscriber = Registry::default().with(stdout_log).with(journald);
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if args.num_heads > MAX_HEADS {
        error!(requested = args.num_heads, max = MAX_HEADS, "too many heads");
        std::process::exit(1);
    }
    if args.mock_prefix.is_some() && (args.cal_path.is_none() || args.pixmap_path.is_none()) {
        eprintln!(
            "you must specify both the calibration file (--cal-path) and the pixel map \
             file (--pixmap-path) if you use the --mock-prefix option"
        );
        std::process::exit(1);
    }
    let out_max_rois = if args.output_prefix.is_some() && args.output_rois < 0 {
        DEFAULT_MAX_ROIS
    } else {
        args.output_rois
    };

    info!(?args, "front end starting");

    let listener = TcpListener::bind(("0.0.0.0", args.local_port))?;
    let exit_fd = set_up_signals()?;

    let time_sync = if args.mock_prefix.is_none() {
        Arc::new(TimeSync::new(args.start_mode))
    } else {
        Arc::new(TimeSync::new(StartupMode::None))
    };

    let mut heads: Vec<HeadControl> = Vec::with_capacity(args.num_heads);
    for head_num in 0..args.num_heads {
        let opts = HeadOptions {
            head_num,
            out_prefix: args.output_prefix.clone(),
            out_max_rois,
            cal_path: args.cal_path.clone(),
            pixmap_path: args.pixmap_path.clone(),
            max_net_frames: args.max_net_frames,
            base_port: args.base_port,
        };
        let ingest = match &args.mock_prefix {
            Some(prefix) => IngestKind::Mock {
                prefix: prefix.clone(),
                delay_ms: args.mock_delay,
            },
            None => IngestKind::V4l2 {
                device_path: format!("/dev/video{}", VIDEO_DEVICE),
                time_sync: time_sync.clone(),
                i2c_address: BASE_FPGA_I2C_ADDR + 2 * head_num as u16,
            },
        };
        heads.push(spawn_head(ingest, opts)?);
    }

    // Main event loop: exits when every head thread has stopped.
    let listener_fd = listener.as_raw_fd();
    while !heads.iter().all(|head| head.stopped()) {
        let mut fds = vec![listener_fd, exit_fd];
        fds.extend(heads.iter().filter(|h| !h.stopped()).map(|h| h.trig_fd()));

        let ready = match select_readable(&fds, None) {
            Ok(ready) => ready,
            Err(err) => {
                error!(%err, "main select failed");
                break;
            }
        };

        if ready.contains(&listener_fd) {
            match listener.accept() {
                Ok((stream, _)) => handle_accept(stream, &heads, &level_handle),
                Err(err) => error!(%err, "accept failed"),
            }
        }

        if ready.contains(&exit_fd) {
            drain_fd(exit_fd);
            info!("shutdown signal received");
            for head in &heads {
                head.exit_thread();
            }
        }

        for head in &heads {
            // A byte here outside a command exchange means the thread
            // has died.
            if ready.contains(&head.trig_fd()) {
                drain_fd(head.trig_fd());
                head.mark_stopped();
            }
        }
    }

    info!("joining head threads");
    for head in &mut heads {
        head.exit_thread();
        head.join();
    }
    info!("exiting");
    Ok(())
}
