// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! EdgeFirst iToF Depth Publisher Library
//!
//! The ingest, reconstruction, and distribution pipeline of an indirect
//! time-of-flight LiDAR sensor head: raw ROI strips arrive from a V4L2
//! MIPI capture device (or mock files), are reconstructed into
//! depth/signal/background/SNR fields per FOV, and are streamed over
//! framed TCP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌─────────────────────────┐
//! │  v4l2 / mock │──►│ SensorHead │──►│ RawToFovs               │
//! │  (ingest)    │   │ (fan-out)  │   │  ├─ GridEngine (worker) │
//! └──────────────┘   └────────────┘   │  └─ StripeEngine        │
//!                          │          └───────────┬─────────────┘
//!                          │ raw mirror           │ FovSegment
//!                          ▼                      ▼
//!                    ┌───────────┐        ┌───────────────┐
//!                    │ RawStream │        │ DepthStream   │
//!                    │ (TCP)     │        │ (Type-D TCP)  │
//!                    └───────────┘        └───────────────┘
//! ```
//!
//! The ROI thread never blocks on finalization: the grid engine's
//! ping/pong raw buffers let the whole-frame worker render FOV N while
//! FOV N+1 fills. The network side draws everything from fixed slab
//! pools and hands chunks to per-stream TCP workers over bounded
//! queues.
//!
//! # Modules
//!
//! - [`metadata`]: 12-bit packed metadata row decoder
//! - [`dsp`], [`binning`], [`nearest`]: reconstruction kernels
//! - [`hdr`]: saturated-ROI retake merge
//! - [`tempcal`]: temperature-dependent range offset
//! - [`grid`], [`stripe`], [`fovs`]: per-FOV engines and multiplexing
//! - [`calibration`]: mapping table and pixel mask loading
//! - [`v4l2`], [`mock`], [`head`]: ingest and thread control
//! - [`pipeline`], [`streamer`], [`wire`], [`netwrap`]: network output
//! - [`control`]: control-byte encodings
//! - [`timesync`]: PTP/PPS bootstrap and FPGA-to-UTC offset

pub mod affinity;
pub mod args;
pub mod binning;
pub mod calibration;
pub mod control;
pub mod dsp;
pub mod fov;
pub mod fovs;
pub mod grid;
pub mod hdr;
pub mod head;
pub mod metadata;
pub mod mock;
pub mod nearest;
pub mod netwrap;
pub mod pipeline;
pub mod pool;
pub mod segment;
pub mod streamer;
pub mod stripe;
pub mod tempcal;
pub mod timesync;
pub mod v4l2;
pub mod wire;

// Re-exports for convenience
pub use fovs::RawToFovs;
pub use head::{spawn_head, HeadControl, HeadOptions, IngestKind};
pub use metadata::Metadata;
pub use segment::FovSegment;
pub use timesync::{StartupMode, TimeSync};
