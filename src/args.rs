// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::timesync::StartupMode;
use clap::Parser;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TCP port of the connection that controls the front end.
    #[arg(short = 'l', long, env, default_value_t = 1234)]
    pub local_port: u16,

    /// TCP base port used to output point cloud data. Zero selects the
    /// default (12566); each FOV stream listens at base + stream index.
    #[arg(short = 'b', long, env, default_value_t = 0)]
    pub base_port: u16,

    /// Enable mocking and replay ROI files named '<PATH>dddd.bin' where
    /// dddd is a sequence number starting from 0000; the front end plays
    /// the sequence and repeats from 0000 at the first gap. Mocking
    /// requires --cal-path and --pixmap-path.
    #[arg(short = 'm', long, env)]
    pub mock_prefix: Option<String>,

    /// When mocking is enabled, the delay (in milliseconds) between the
    /// times ROIs are presented to the reconstruction engine.
    #[arg(short = 't', long, env, default_value_t = -1)]
    pub mock_delay: i64,

    /// Read the sensor mapping table from this path instead of the file
    /// provided by the system control code.
    #[arg(short = 'c', long, env)]
    pub cal_path: Option<PathBuf>,

    /// Read the pixel map from this path instead of the file provided
    /// by the system control code.
    #[arg(short = 'p', long, env)]
    pub pixmap_path: Option<PathBuf>,

    /// Number of sensor heads to enable. The NCB carries one.
    #[arg(short = 'n', long, env, default_value_t = 1)]
    pub num_heads: usize,

    /// Enable raw output streaming to files; names are
    /// 'PATH_h_ss_dddd.bin' where h is the head number, ss the session
    /// number, and dddd the ROI number.
    #[arg(short = 'o', long, env)]
    pub output_prefix: Option<String>,

    /// Maximum number of ROIs output in a single session when raw
    /// output streaming is enabled; defaults to 91 if omitted.
    #[arg(short = 'r', long, env, default_value_t = -1)]
    pub output_rois: i32,

    /// Stop network streaming after this many frames; 0 disables
    /// network output, negative streams without limit.
    #[arg(long, env, default_value_t = -1)]
    pub max_net_frames: i32,

    /// Startup time-synchronization mode. Ignored when mocking.
    #[arg(short = 's', long, env, value_enum, default_value_t = StartupMode::None)]
    pub start_mode: StartupMode,

    /// Application log level.
    #[arg(long, env, default_value = "info")]
    pub rust_log: LevelFilter,
}
