// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Best-effort CPU pinning on the embedded target.
//!
//! The sensor head board runs a big.LITTLE part with four A53s (cores
//! 0-3) and two A72s (cores 4-5). The ingest thread and the whole-frame
//! workers are pinned to the big cores to keep the DSP path off the
//! small ones. Everywhere else (development hosts) pinning is skipped.

use std::path::Path;
use tracing::warn;

const A72_BASE: usize = 4;
const CPU_COUNT: usize = 6;

/// Marker file present only on the embedded board image.
const BOARD_MARKER: &str = "/etc/lumotive_fs_rev";

fn is_board() -> bool {
    Path::new(BOARD_MARKER).exists()
}

/// Pin the calling thread to big core `idx` (0 or 1). A no-op off the
/// board; failures only warn.
pub fn pin_to_big_core(idx: usize) {
    if !is_board() {
        return;
    }
    let processor = A72_BASE + idx;
    if processor >= CPU_COUNT {
        warn!(processor, "invalid processor for affinity request");
        return;
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(processor, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!(
                errno = std::io::Error::last_os_error().raw_os_error(),
                "sched_setaffinity failed"
            );
        }
    }
}
