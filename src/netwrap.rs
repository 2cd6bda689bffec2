// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Network wrappers: reformat reconstruction output into wire chunks and
//! drive one TCP worker per output stream.
//!
//! The depth wrapper tiles a [`FovSegment`] into 64-sample Type-D
//! packets with scene sequencing and per-packet "chunky" timestamps.
//! The raw wrapper mirrors whole ROIs, gated to complete frames of
//! FOV 0 so the mirror never back-pressures the depth path.

use crate::calibration::{MappingTable, MAPPING_TABLE_HEIGHT, MAPPING_TABLE_WIDTH};
use crate::metadata::{Metadata, ROI_SIZE};
use crate::pipeline::{ChunkQueue, PipelinePools};
use crate::segment::FovSegment;
use crate::streamer::TcpFramedStreamer;
use crate::wire::{self, SceneSequencer, TimestampScale, MAX_CPI_PER_RETURN};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, warn};

/// Depth streams listen at base + stream index.
pub const NET_OUTPUT_BASE_PORT: u16 = 12566;
/// Raw streams listen at base + head number.
pub const NET_OUTPUT_RAW_BASE_PORT: u16 = 12345;

const DEVICE_VERSION: u32 = 1;

const NUM_FRAME_BUFFERS: usize = 5;
const NUM_CPI_BUFFERS: usize = 240 * 10 * NUM_FRAME_BUFFERS;
const NET_FRAME_SIZE: usize = 946 * 10 * 240;
const NET_SEND_BUFFER: usize = NET_FRAME_SIZE * 20;
const NET_RAW_SEND_BUFFER: usize = ROI_SIZE * 4;

// FPGA fine timestamps tick in 10 ns units; coarse stamps before this
// (year 2004) are treated as arbitrary rather than UTC.
const FPGA_TIMESTAMP_UNITS: u64 = 10;
const ARB_TIME_FILTER: u64 = 0x4000_0000;
const PTP_FINE_MASK: u32 = 0x3fff_ffff;
const PTP_COARSE_MASK: u64 = 0x0000_ffff_ffff_ffff;

fn encode_timestamp(words: &[u32; 3]) -> ([u8; 10], TimestampScale) {
    let coarse = (u64::from(words[2]) << 32) + u64::from(words[1]);
    let secs = (coarse & PTP_COARSE_MASK).to_be_bytes();
    let nanos = ((words[0] & PTP_FINE_MASK) as u64 * FPGA_TIMESTAMP_UNITS) as u32;

    let mut out = [0u8; 10];
    out[0..6].copy_from_slice(&secs[2..8]);
    out[6..10].copy_from_slice(&nanos.to_be_bytes());
    let scale = if coarse < ARB_TIME_FILTER {
        TimestampScale::Arb
    } else {
        TimestampScale::Utc
    };
    (out, scale)
}

fn worker_name(kind: StreamKind, idx: usize) -> String {
    match kind {
        StreamKind::Depth => format!("net-depth-{idx}"),
        StreamKind::Raw => format!("net-raw-{idx}"),
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum StreamKind {
    Depth,
    Raw,
}

struct StreamShared {
    device_id: AtomicU32,
    config_locked: AtomicBool,
}

fn spawn_worker(
    kind: StreamKind,
    idx: usize,
    mut streamer: TcpFramedStreamer,
    queue: Arc<ChunkQueue>,
    pools: Arc<PipelinePools>,
    shared: Arc<StreamShared>,
    max_net_frames: i32,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(worker_name(kind, idx))
        .spawn(move || {
            let mut scenes = SceneSequencer::new();
            let mut packet = Vec::with_capacity(wire::TYPE_D_PACKET_SIZE);
            let mut calibration: Option<Arc<MappingTable>> = None;
            let mut frames_remaining = max_net_frames.max(0) as u64;

            while let Some(chunk) = queue.pop() {
                let new_client = streamer.accept_new_connection();
                if new_client {
                    shared.config_locked.store(true, Ordering::Release);
                    frames_remaining = max_net_frames.max(0) as u64;
                    if kind == StreamKind::Depth {
                        if let Some(table) = &calibration {
                            send_mapping_table(&mut streamer, table, &mut scenes, &shared, &mut packet);
                        }
                    }
                }

                let frame_limited = max_net_frames >= 0 && frames_remaining == 0;
                streamer.cork(true);
                match kind {
                    StreamKind::Depth => {
                        scenes.begin_chunk();
                        for cpi in &chunk.cpis {
                            if cpi.suppress_stream {
                                continue;
                            }
                            if cpi.calibration.is_some() {
                                calibration.clone_from(&cpi.calibration);
                            }
                            if cpi.prefix_meta_update {
                                if let Some(table) = &calibration {
                                    send_mapping_table(
                                        &mut streamer,
                                        table,
                                        &mut scenes,
                                        &shared,
                                        &mut packet,
                                    );
                                }
                            }
                            let (flags, seqs) = scenes.advance(cpi.last_cpi_in_frame);
                            if frame_limited {
                                continue;
                            }
                            wire::encode_type_d(
                                &mut packet,
                                cpi,
                                DEVICE_VERSION,
                                shared.device_id.load(Ordering::Acquire),
                                scenes.seq - 1,
                                flags,
                                seqs,
                            );
                            streamer.send_framed(&packet);
                        }
                    }
                    StreamKind::Raw => {
                        if let Some(roi) = &chunk.roi {
                            if !frame_limited {
                                streamer.send_framed(&roi.roi);
                            }
                        }
                    }
                }
                streamer.cork(false);
                if max_net_frames >= 0 {
                    frames_remaining = frames_remaining.saturating_sub(1);
                }

                pools.dispose_chunk(chunk);
            }
        })
        .expect("spawning network worker")
}

/// Emit the full mapping table as Type-C packets, row-major in
/// 64-entry stripes.
fn send_mapping_table(
    streamer: &mut TcpFramedStreamer,
    table: &MappingTable,
    scenes: &mut SceneSequencer,
    shared: &StreamShared,
    packet: &mut Vec<u8>,
) {
    if table.is_empty() {
        return;
    }
    streamer.cork(true);
    let mut index = 0usize;
    for payload_v in 0..MAPPING_TABLE_HEIGHT {
        let mut payload_u = 0usize;
        while payload_u < MAPPING_TABLE_WIDTH {
            let seq = scenes.seq;
            scenes.seq += 1;
            wire::encode_type_c(
                packet,
                table,
                (MAPPING_TABLE_WIDTH, MAPPING_TABLE_HEIGHT),
                payload_u,
                payload_v,
                index,
                DEVICE_VERSION,
                shared.device_id.load(Ordering::Acquire),
                seq,
            );
            streamer.send_framed(packet);
            index += (MAPPING_TABLE_WIDTH - payload_u).min(MAX_CPI_PER_RETURN);
            payload_u += MAX_CPI_PER_RETURN;
        }
    }
    streamer.cork(false);
}

/// One point-cloud output stream: pools, queue, and its TCP worker.
pub struct DepthStream {
    pools: Arc<PipelinePools>,
    queue: Arc<ChunkQueue>,
    shared: Arc<StreamShared>,
    latch_meta_update: bool,
    worker: Option<thread::JoinHandle<()>>,
}

impl DepthStream {
    pub fn new(stream_idx: usize, max_net_frames: i32, base_port: u16) -> io::Result<DepthStream> {
        let pools = Arc::new(PipelinePools::new(NUM_FRAME_BUFFERS, NUM_CPI_BUFFERS, 0));
        let queue = Arc::new(ChunkQueue::new(NUM_FRAME_BUFFERS + 1));
        let shared = Arc::new(StreamShared {
            device_id: AtomicU32::new(1),
            config_locked: AtomicBool::new(false),
        });
        let streamer = TcpFramedStreamer::new(
            base_port + stream_idx as u16,
            NET_SEND_BUFFER,
            "depth",
        )?;
        let worker = spawn_worker(
            StreamKind::Depth,
            stream_idx,
            streamer,
            queue.clone(),
            pools.clone(),
            shared.clone(),
            max_net_frames,
        );
        Ok(DepthStream {
            pools,
            queue,
            shared,
            latch_meta_update: false,
            worker: Some(worker),
        })
    }

    /// Tile one finished FOV into a chunk of Type-D CPI returns and hand
    /// it to the worker. Pool exhaustion drops the frame with a warning.
    pub fn hand_in_depth(&mut self, segment: &FovSegment) {
        if segment.new_mapping_table {
            self.latch_meta_update = true;
        }
        if !self.shared.config_locked.load(Ordering::Acquire) {
            self.shared
                .device_id
                .store(u32::from(segment.sensor_id), Ordering::Release);
        }

        let (steer_dim, stare_dim) = segment.image_size;
        let stare_steps = stare_dim.div_ceil(MAX_CPI_PER_RETURN);

        let mut chunk = match self.pools.chunks.get() {
            Some(chunk) => chunk,
            None => {
                warn!("no return chunk available, skipping frame");
                return;
            }
        };

        // Chunky timestamps fall back to the previous packet's when a
        // packet carries no valid range at all.
        let default_ts = segment.timestamps_vec.first().copied().unwrap_or([0; 3]);
        let (mut prev_ts, mut prev_scale) = encode_timestamp(&default_ts);
        let mut seen = Vec::with_capacity(MAX_CPI_PER_RETURN);

        for steer in 0..steer_dim {
            for stare_step in 0..stare_steps {
                let mut cpi = match self.pools.cpis.get() {
                    Some(cpi) => cpi,
                    None => {
                        warn!("CPI pool exhausted, skipping frame");
                        self.pools.dispose_chunk(chunk);
                        return;
                    }
                };

                if self.latch_meta_update {
                    cpi.prefix_meta_update = true;
                    self.latch_meta_update = false;
                }
                cpi.calibration.clone_from(&segment.mapping_table);
                cpi.suppress_stream = segment.disable_streaming;

                cpi.complete_size_steer = steer_dim as u16;
                cpi.complete_size_stare = stare_dim as u16;
                cpi.starting_steer_order = steer as u16;
                cpi.starting_stare_order = (stare_step * MAX_CPI_PER_RETURN) as u16;
                cpi.bs_steer_offset = (segment.mapping_table_start.0
                    + steer as u32 * segment.mapping_table_step.0)
                    as u16;
                cpi.bs_steer_step = segment.mapping_table_step.0 as u16;
                cpi.bs_stare_offset = (segment.mapping_table_start.1
                    + u32::from(cpi.starting_stare_order) * segment.mapping_table_step.1)
                    as u16;
                cpi.bs_stare_step = segment.mapping_table_step.1 as u16;
                cpi.bs_user_tag = segment.user_tag;
                cpi.last_cpi_in_frame =
                    steer == steer_dim - 1 && stare_step == stare_steps - 1;

                seen.clear();
                for channel in 0..MAX_CPI_PER_RETURN {
                    let stare = stare_step * MAX_CPI_PER_RETURN + channel;
                    if stare >= stare_dim {
                        break;
                    }
                    let idx = steer * stare_dim + stare;
                    if segment.ranges[idx] != 0 {
                        cpi.range_valid[channel] = true;
                        cpi.range[channel] = segment.ranges[idx];
                        seen.push(segment.roi_indices[idx]);
                    }
                    cpi.intensity_valid[channel] = true;
                    cpi.intensity[channel] = segment.signal[idx];
                    cpi.background_valid[channel] = true;
                    cpi.background[channel] = segment.background[idx];
                    cpi.snr_valid[channel] = true;
                    cpi.snr[channel] = segment.snr[idx];
                }

                if !seen.is_empty() {
                    seen.sort_unstable();
                    let median = seen[seen.len() / 2] as usize;
                    if let Some(words) = segment.timestamps_vec.get(median) {
                        let (ts, scale) = encode_timestamp(words);
                        prev_ts = ts;
                        prev_scale = scale;
                    }
                }
                cpi.timestamp = prev_ts;
                cpi.tscale = prev_scale;

                chunk.cpis.push(cpi);
            }
        }

        self.queue.hand_in(chunk);
    }

    pub fn shutdown(&mut self) {
        self.queue.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DepthStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The raw-ROI mirror for one head.
pub struct RawStream {
    pools: Arc<PipelinePools>,
    queue: Arc<ChunkQueue>,
    worker: Option<thread::JoinHandle<()>>,
    transmit_in_progress: bool,
    num_rois: u16,
}

impl RawStream {
    pub fn new(head_num: usize, rois_in_buffer: usize) -> io::Result<RawStream> {
        let pools = Arc::new(PipelinePools::new(rois_in_buffer, 0, rois_in_buffer));
        let queue = Arc::new(ChunkQueue::new(rois_in_buffer + 1));
        let shared = Arc::new(StreamShared {
            device_id: AtomicU32::new(1),
            config_locked: AtomicBool::new(false),
        });
        let streamer = TcpFramedStreamer::new(
            NET_OUTPUT_RAW_BASE_PORT + head_num as u16,
            NET_RAW_SEND_BUFFER,
            "raw",
        )?;
        let worker = spawn_worker(
            StreamKind::Raw,
            head_num,
            streamer,
            queue.clone(),
            pools.clone(),
            shared,
            -1,
        );
        Ok(RawStream {
            pools,
            queue,
            worker: Some(worker),
            transmit_in_progress: false,
            num_rois: 0,
        })
    }

    /// Mirror one raw ROI. Only complete frames of FOV 0 go out, one
    /// frame at a time; between frames the pool must fully drain so the
    /// mirror never throttles the ingest path. Returns true when the ROI
    /// was accepted.
    pub fn hand_in_roi(&mut self, roi: &[u8], first_raw_roi: bool) -> bool {
        if roi.len() != ROI_SIZE {
            error!(
                len = roi.len(),
                expected = ROI_SIZE,
                "raw ROI has the wrong size"
            );
            return false;
        }

        if first_raw_roi {
            self.transmit_in_progress = false;
            self.num_rois = 0;
        }

        let mdat = match Metadata::new(roi) {
            Ok(m) => m,
            Err(_) => return false,
        };
        if !mdat.is_fov_active(0) {
            return false;
        }
        let fov_num_rois = mdat.fov_num_rois(0);
        if fov_num_rois as usize > self.pools.chunks.capacity() {
            error!(
                pool = self.pools.chunks.capacity(),
                rois = fov_num_rois,
                "memory pool too small for one frame of raw ROIs"
            );
            return false;
        }

        if self.num_rois >= fov_num_rois {
            if self.pools.chunks.available() == self.pools.chunks.capacity() {
                // Fully drained; ready for the next frame.
                self.num_rois = 0;
                self.transmit_in_progress = false;
            } else {
                return false;
            }
        }

        if mdat.first_roi(0) {
            if self.transmit_in_progress {
                return false; // still sending the previous frame
            }
            self.transmit_in_progress = true;
        }
        if !self.transmit_in_progress {
            return false;
        }

        self.num_rois += 1;

        // Pool exhaustion on this path means the gating above is broken.
        let mut chunk = match self.pools.chunks.get() {
            Some(chunk) => chunk,
            None => {
                error!("no return chunk available on the raw path");
                std::process::exit(1);
            }
        };
        let mut roi_return = match self.pools.rois.get() {
            Some(r) => r,
            None => {
                error!("no ROI buffer available on the raw path");
                std::process::exit(1);
            }
        };
        roi_return.roi.copy_from_slice(roi);
        chunk.roi = Some(roi_return);
        self.queue.hand_in(chunk);
        true
    }

    pub fn shutdown(&mut self) {
        self.queue.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RawStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_segment(steer: usize, stare: usize) -> FovSegment {
        let pixels = steer * stare;
        FovSegment {
            fov_idx: 0,
            head_num: 0,
            timestamp: 0,
            sensor_id: 0x700,
            user_tag: 0xbf,
            frame_completed: true,
            disable_streaming: false,
            gcf: 5.95e6,
            max_unambiguous_range: 25.2,
            image_size: (steer, stare),
            ranges: (0..pixels).map(|i| (i % 7) as u16 * 100).collect(),
            snr: vec![9; pixels],
            signal: vec![5; pixels],
            background: vec![3; pixels],
            roi_indices: (0..pixels).map(|i| (i % 3) as u16).collect(),
            timestamps: vec![1, 2, 3],
            timestamps_vec: vec![[100, 0x5000_0000, 0], [200, 0x5000_0000, 0], [300, 0x5000_0000, 0]],
            mapping_table_start: (1, 1),
            mapping_table_step: (2, 2),
            fov_start: (0, 0),
            fov_step: (1, 1),
            mapping_table: None,
            new_mapping_table: false,
        }
    }

    #[test]
    fn test_timestamp_encoding_scale() {
        // Coarse seconds below the 2004 filter are arbitrary.
        let (_, scale) = encode_timestamp(&[0, 100, 0]);
        assert_eq!(scale, TimestampScale::Arb);
        let (bytes, scale) = encode_timestamp(&[5, 0x5000_0000, 0]);
        assert_eq!(scale, TimestampScale::Utc);
        // Fine part is 10 ns units.
        assert_eq!(u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]), 50);
    }

    #[test]
    fn test_depth_tiling_counts() {
        let mut stream = DepthStream::new(900, -1, 40000).unwrap();
        let segment = test_segment(4, 130);
        stream.hand_in_depth(&segment);

        // 4 steer angles x ceil(130/64) = 3 stare steps = 12 CPIs.
        // Wait for the worker to drain the queue and dispose the chunk.
        for _ in 0..500 {
            if stream.queue.is_empty() && stream.pools.cpis.available() == NUM_CPI_BUFFERS {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(stream.pools.cpis.available(), NUM_CPI_BUFFERS);
        stream.shutdown();
    }

    #[test]
    fn test_raw_gating_requires_first_roi() {
        let mut stream = RawStream::new(100, 4).unwrap();
        let mut words = crate::metadata::default_metadata_words();
        crate::metadata::build::set(&mut words, crate::metadata::build::START_STOP_FLAGS, 0);
        let mut roi = crate::metadata::build::to_bytes(&words);
        roi.resize(ROI_SIZE, 0);

        // Not a first ROI and no frame in progress: rejected.
        assert!(!stream.hand_in_roi(&roi, true));
        stream.shutdown();
    }
}
