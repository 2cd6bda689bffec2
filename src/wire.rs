// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Byte-precise wire formats for the point-cloud TCP streams.
//!
//! Every logical message is prefixed with a 16-byte framing header (a
//! big-endian payload length plus reserved bytes). Payloads start with
//! an 18-byte global header (magic "BCDA"), followed by a Type-D pixel
//! packet or a Type-C calibration packet. All multi-byte fields are
//! big-endian.

use crate::calibration::MappingTable;
use std::sync::Arc;

pub const FRAMING_HEADER_SIZE: usize = 16;
pub const GLOBAL_HEADER_SIZE: usize = 18;

pub const PROTO_MAGIC: [u8; 4] = *b"BCDA";
const PROTO_VERSION: u8 = 1;
pub const PROTO_TYPE_D: u8 = 0xD;
pub const PROTO_TYPE_C: u8 = 0xC;

/// Samples per Type-D packet and mapping-table entries per Type-C packet.
pub const MAX_CPI_PER_RETURN: usize = 64;
/// Largest depth-stream payload.
pub const DEPTH_PAYLOAD_MAX: usize = 1472;

const TIMESTAMP_SIZE: usize = 10;
const TYPE_D_HEADER_SIZE: usize = TIMESTAMP_SIZE + 1 + 16 + 4 + 4 + 10;
const TYPE_D_RETURN_SIZE: usize = 10;
pub const TYPE_D_PACKET_SIZE: usize =
    GLOBAL_HEADER_SIZE + TYPE_D_HEADER_SIZE + MAX_CPI_PER_RETURN * TYPE_D_RETURN_SIZE;

const TYPE_C_HEADER_SIZE: usize = 16;
pub const TYPE_C_PACKET_SIZE: usize = GLOBAL_HEADER_SIZE + TYPE_C_HEADER_SIZE + MAX_CPI_PER_RETURN * 8;

// Type-D per-return flag bits.
pub const RET_RANGE_VALID: u8 = 1;
pub const RET_INTENSITY_VALID: u8 = 2;
pub const RET_BACKGROUND_VALID: u8 = 4;
pub const RET_SNR_VALID: u8 = 8;

// Type-D scene sequence flags, lower nibble of tscale_aoSeqFlags.
pub const AO_LAST_SCENE_BEGIN_VALID: u8 = 1;
pub const AO_LAST_SCENE_END_VALID: u8 = 2;
pub const AO_CURRENT_SCENE_BEGIN_VALID: u8 = 4;
pub const AO_CURRENT_SCENE_END_VALID: u8 = 8;

/// Type-C parameter type for the theta/phi coordinate map.
pub const TYPE_C_COORDINATE_MAP: u8 = 2;

/// Timescale of a packet timestamp, upper nibble of tscale_aoSeqFlags.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimestampScale {
    Tai = 0,
    Utc = 1,
    Gps = 2,
    Arb = 3,
}

/// One tile of up to 64 output samples plus the header context to place
/// it, drawn from a slab pool and carried inside a return chunk.
pub struct CpiReturn {
    pub range: [u16; MAX_CPI_PER_RETURN],
    pub range_valid: [bool; MAX_CPI_PER_RETURN],
    pub intensity: [u16; MAX_CPI_PER_RETURN],
    pub intensity_valid: [bool; MAX_CPI_PER_RETURN],
    pub background: [u16; MAX_CPI_PER_RETURN],
    pub background_valid: [bool; MAX_CPI_PER_RETURN],
    pub snr: [u16; MAX_CPI_PER_RETURN],
    pub snr_valid: [bool; MAX_CPI_PER_RETURN],

    pub timestamp: [u8; TIMESTAMP_SIZE],
    pub tscale: TimestampScale,
    pub complete_size_steer: u16,
    pub complete_size_stare: u16,
    pub starting_steer_order: u16,
    pub starting_stare_order: u16,
    pub bs_steer_offset: u16,
    pub bs_steer_step: u16,
    pub bs_stare_offset: u16,
    pub bs_stare_step: u16,
    pub bs_user_tag: u16,

    pub suppress_stream: bool,
    pub last_cpi_in_frame: bool,
    pub prefix_meta_update: bool,
    pub calibration: Option<Arc<MappingTable>>,
}

impl Default for CpiReturn {
    fn default() -> Self {
        CpiReturn {
            range: [0; MAX_CPI_PER_RETURN],
            range_valid: [false; MAX_CPI_PER_RETURN],
            intensity: [0; MAX_CPI_PER_RETURN],
            intensity_valid: [false; MAX_CPI_PER_RETURN],
            background: [0; MAX_CPI_PER_RETURN],
            background_valid: [false; MAX_CPI_PER_RETURN],
            snr: [0; MAX_CPI_PER_RETURN],
            snr_valid: [false; MAX_CPI_PER_RETURN],
            timestamp: [0; TIMESTAMP_SIZE],
            tscale: TimestampScale::Arb,
            complete_size_steer: 0,
            complete_size_stare: 0,
            starting_steer_order: 0,
            starting_stare_order: 0,
            bs_steer_offset: 0,
            bs_steer_step: 0,
            bs_stare_offset: 0,
            bs_stare_step: 0,
            bs_user_tag: 0,
            suppress_stream: false,
            last_cpi_in_frame: false,
            prefix_meta_update: false,
            calibration: None,
        }
    }
}

impl CpiReturn {
    /// Reset to pool-fresh state before reuse.
    pub fn clean(&mut self) {
        *self = CpiReturn {
            calibration: None,
            ..CpiReturn::default()
        };
    }
}

/// Scene/sequence bookkeeping for one TCP stream. Sequence numbers are
/// strictly monotonic per connection; scene N's end always precedes
/// scene N+1's begin.
#[derive(Default)]
pub struct SceneSequencer {
    pub seq: u32,
    last_valid: bool,
    this_valid: bool,
    last_begin: u32,
    last_end: u32,
    this_begin: u32,
    this_last: u32,
    new_scene: bool,
}

impl SceneSequencer {
    pub fn new() -> SceneSequencer {
        SceneSequencer {
            new_scene: true,
            ..Default::default()
        }
    }

    /// Call at the start of each chunk: the chunk boundary is a scene
    /// boundary when the previous chunk completed its frame.
    pub fn begin_chunk(&mut self) {
        self.new_scene = true;
    }

    /// Advance for one outgoing packet, returning the header flag bits
    /// and the four scene sequence numbers.
    pub fn advance(&mut self, last_in_frame: bool) -> (u8, [u32; 4]) {
        if self.new_scene {
            self.last_valid = self.this_valid;
            self.last_begin = self.this_begin;
            self.last_end = self.this_last;
            self.this_valid = true;
            self.this_begin = self.seq;
            self.new_scene = false;
        }

        let mut flags = 0u8;
        let mut seqs = [0u32; 4];
        if self.last_valid {
            flags |= AO_LAST_SCENE_BEGIN_VALID | AO_LAST_SCENE_END_VALID;
            seqs[0] = self.last_begin;
            seqs[1] = self.last_end;
        }
        if self.this_valid {
            flags |= AO_CURRENT_SCENE_BEGIN_VALID;
            seqs[2] = self.this_begin;
            if last_in_frame {
                flags |= AO_CURRENT_SCENE_END_VALID;
                seqs[3] = self.seq;
            }
        }

        self.this_last = self.seq;
        self.seq += 1;
        if last_in_frame {
            self.new_scene = true;
        }
        (flags, seqs)
    }
}

/// Write the 16-byte framing header ahead of a payload of `len` bytes.
pub fn write_framing_header(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.extend_from_slice(&[0u8; FRAMING_HEADER_SIZE - 4]);
}

fn write_global_header(buf: &mut Vec<u8>, packet_type: u8, device_version: u32, device_id: u32, seq: u32) {
    buf.extend_from_slice(&PROTO_MAGIC);
    buf.push((PROTO_VERSION << 4) | packet_type);
    buf.extend_from_slice(&device_version.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&device_id.to_be_bytes());
    buf.push(0); // reserved
}

/// Serialize one Type-D pixel packet.
pub fn encode_type_d(
    buf: &mut Vec<u8>,
    cpi: &CpiReturn,
    device_version: u32,
    device_id: u32,
    seq: u32,
    ao_flags: u8,
    scene_seqs: [u32; 4],
) {
    buf.clear();
    write_global_header(buf, PROTO_TYPE_D, device_version, device_id, seq);

    buf.extend_from_slice(&cpi.timestamp);
    buf.push(((cpi.tscale as u8) << 4) | (ao_flags & 0x0f));
    for s in scene_seqs {
        buf.extend_from_slice(&s.to_be_bytes());
    }
    buf.extend_from_slice(&cpi.complete_size_steer.to_be_bytes());
    buf.extend_from_slice(&cpi.complete_size_stare.to_be_bytes());
    buf.extend_from_slice(&cpi.starting_steer_order.to_be_bytes());
    buf.extend_from_slice(&cpi.starting_stare_order.to_be_bytes());
    buf.extend_from_slice(&cpi.bs_steer_offset.to_be_bytes());
    buf.extend_from_slice(&cpi.bs_steer_step.to_be_bytes());
    buf.extend_from_slice(&cpi.bs_stare_offset.to_be_bytes());
    buf.extend_from_slice(&cpi.bs_stare_step.to_be_bytes());
    buf.extend_from_slice(&cpi.bs_user_tag.to_be_bytes());

    for channel in 0..MAX_CPI_PER_RETURN {
        let mut flags = 0u8;
        let mut write16 = |buf: &mut Vec<u8>, valid: bool, value: u16, bit: u8, flags: &mut u8| {
            if valid {
                buf.extend_from_slice(&value.to_be_bytes());
                *flags |= bit;
            } else {
                buf.extend_from_slice(&[0, 0]);
            }
        };
        write16(buf, cpi.intensity_valid[channel], cpi.intensity[channel], RET_INTENSITY_VALID, &mut flags);
        write16(buf, cpi.range_valid[channel], cpi.range[channel], RET_RANGE_VALID, &mut flags);
        write16(buf, cpi.background_valid[channel], cpi.background[channel], RET_BACKGROUND_VALID, &mut flags);
        write16(buf, cpi.snr_valid[channel], cpi.snr[channel], RET_SNR_VALID, &mut flags);
        buf.push(0); // extra annotation
        buf.push(flags);
    }

    debug_assert_eq!(buf.len(), TYPE_D_PACKET_SIZE);
}

/// Serialize one Type-C mapping-table packet carrying up to 64
/// theta/phi entries starting at (payload_u, payload_v).
#[allow(clippy::too_many_arguments)]
pub fn encode_type_c(
    buf: &mut Vec<u8>,
    table: &MappingTable,
    table_size: (usize, usize),
    payload_u: usize,
    payload_v: usize,
    start_index: usize,
    device_version: u32,
    device_id: u32,
    seq: u32,
) {
    buf.clear();
    write_global_header(buf, PROTO_TYPE_C, device_version, device_id, seq);

    let (width, height) = table_size;
    buf.extend_from_slice(&((width - 1) as u16).to_be_bytes());
    buf.extend_from_slice(&((height - 1) as u16).to_be_bytes());
    buf.extend_from_slice(&(payload_u as u16).to_be_bytes());
    buf.extend_from_slice(&(payload_v as u16).to_be_bytes());
    buf.push(TYPE_C_COORDINATE_MAP);
    buf.extend_from_slice(&[0u8; 7]); // reserved

    for entry in 0..MAX_CPI_PER_RETURN {
        // Lines are zero-padded rather than wrapped.
        if payload_u + entry >= width || start_index + entry >= table.len() {
            buf.extend_from_slice(&[0u8; 8]);
            continue;
        }
        let idx = start_index + entry;
        buf.extend_from_slice(&table.theta[idx].to_be_bytes());
        buf.extend_from_slice(&table.phi[idx].to_be_bytes());
    }

    debug_assert_eq!(buf.len(), TYPE_C_PACKET_SIZE);
}

/// Locate the start of the next framed packet in a byte stream: a
/// framing header whose payload begins with the protocol magic and
/// whose declared length is plausible. Used by consumers to re-align
/// after joining mid-stream.
pub fn find_packet_start(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAMING_HEADER_SIZE + PROTO_MAGIC.len() {
        return None;
    }
    for pos in 0..=buf.len() - FRAMING_HEADER_SIZE - PROTO_MAGIC.len() {
        if buf[pos + FRAMING_HEADER_SIZE..pos + FRAMING_HEADER_SIZE + 4] != PROTO_MAGIC {
            continue;
        }
        let len = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        if len as usize >= GLOBAL_HEADER_SIZE && len as usize <= DEPTH_PAYLOAD_MAX {
            return Some(pos);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_header_length_field() {
        let mut buf = Vec::new();
        write_framing_header(&mut buf, 703);
        assert_eq!(buf.len(), FRAMING_HEADER_SIZE);
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len, 703);
        assert!(buf[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_type_d_layout() {
        let mut cpi = CpiReturn::default();
        cpi.range[0] = 0x1234;
        cpi.range_valid[0] = true;
        cpi.intensity[0] = 0x5678;
        cpi.intensity_valid[0] = true;
        cpi.complete_size_steer = 480;
        cpi.complete_size_stare = 640;
        cpi.bs_user_tag = 0xbf;
        cpi.tscale = TimestampScale::Utc;

        let mut buf = Vec::new();
        encode_type_d(&mut buf, &cpi, 1, 2, 42, AO_CURRENT_SCENE_BEGIN_VALID, [0, 0, 7, 0]);

        assert_eq!(buf.len(), TYPE_D_PACKET_SIZE);
        assert_eq!(&buf[0..4], b"BCDA");
        assert_eq!(buf[4], (1 << 4) | 0xD);
        // Sequence at bytes 9..13, big-endian.
        assert_eq!(u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]), 42);
        // tscale nibble + flags.
        let tf = buf[GLOBAL_HEADER_SIZE + TIMESTAMP_SIZE];
        assert_eq!(tf >> 4, TimestampScale::Utc as u8);
        assert_eq!(tf & 0x0f, AO_CURRENT_SCENE_BEGIN_VALID);

        // First return entry: intensity, range, background, snr, ann, flags.
        let ret = GLOBAL_HEADER_SIZE + TYPE_D_HEADER_SIZE;
        assert_eq!(u16::from_be_bytes([buf[ret], buf[ret + 1]]), 0x5678);
        assert_eq!(u16::from_be_bytes([buf[ret + 2], buf[ret + 3]]), 0x1234);
        assert_eq!(buf[ret + 9], RET_RANGE_VALID | RET_INTENSITY_VALID);
        // Second return entry carries no data.
        assert_eq!(buf[ret + TYPE_D_RETURN_SIZE + 9], 0);
    }

    #[test]
    fn test_scene_sequencer_monotonic() {
        let mut scenes = SceneSequencer::new();
        let mut seqs = Vec::new();
        for frame in 0..3 {
            scenes.begin_chunk();
            for pkt in 0..4 {
                let seq = scenes.seq;
                let (_flags, _s) = scenes.advance(pkt == 3);
                seqs.push(seq);
                let _ = frame;
            }
        }
        for pair in seqs.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_scene_end_precedes_next_begin() {
        let mut scenes = SceneSequencer::new();
        scenes.begin_chunk();
        let (_, _) = scenes.advance(false);
        let (flags_end, seqs_end) = scenes.advance(true);
        assert!(flags_end & AO_CURRENT_SCENE_END_VALID != 0);
        let end_seq = seqs_end[3];

        scenes.begin_chunk();
        let (flags_next, seqs_next) = scenes.advance(false);
        assert!(flags_next & AO_LAST_SCENE_END_VALID != 0);
        assert_eq!(seqs_next[1], end_seq);
        assert!(seqs_next[2] > end_seq);
    }

    #[test]
    fn test_type_c_layout() {
        let table = MappingTable {
            x: vec![0; 128],
            y: vec![0; 128],
            theta: (0..128).collect(),
            phi: (0..128).map(|v| -v).collect(),
        };
        let mut buf = Vec::new();
        encode_type_c(&mut buf, &table, (100, 2), 64, 0, 64, 1, 2, 9);
        assert_eq!(buf.len(), TYPE_C_PACKET_SIZE);
        assert_eq!(buf[4], (1 << 4) | 0xC);

        let tch = GLOBAL_HEADER_SIZE;
        assert_eq!(u16::from_be_bytes([buf[tch], buf[tch + 1]]), 99); // image end U
        assert_eq!(u16::from_be_bytes([buf[tch + 4], buf[tch + 5]]), 64); // payload start U
        assert_eq!(buf[tch + 8], TYPE_C_COORDINATE_MAP);

        // First entry is table index 64.
        let data = GLOBAL_HEADER_SIZE + TYPE_C_HEADER_SIZE;
        let theta = i32::from_be_bytes([buf[data], buf[data + 1], buf[data + 2], buf[data + 3]]);
        assert_eq!(theta, 64);
        // Entries past the line end (width 100 - 64 = 36 live) zero-pad.
        let pad = data + 40 * 8;
        assert_eq!(&buf[pad..pad + 8], &[0u8; 8]);
    }

    #[test]
    fn test_find_packet_start_realigns() {
        // 40 bytes with a valid framed header at offset 4: a misaligned
        // reader that consumed the first 20 bytes can relocate to 4 and
        // read the magic and length correctly.
        let mut stream = vec![0xa5u8; 4];
        let mut packet = Vec::new();
        write_framing_header(&mut packet, 703);
        packet.extend_from_slice(&PROTO_MAGIC);
        stream.extend_from_slice(&packet);
        stream.resize(40, 0);

        let pos = find_packet_start(&stream).unwrap();
        assert_eq!(pos, 4);
        let len = u32::from_be_bytes([stream[pos], stream[pos + 1], stream[pos + 2], stream[pos + 3]]);
        assert_eq!(len, 703);
        assert_eq!(&stream[pos + 16..pos + 20], b"BCDA");
    }
}
