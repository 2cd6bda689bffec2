// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! FPGA-to-UTC time synchronization.
//!
//! A bootstrap task shells out through a pinned sequence to bring up
//! either the PTP servo (ptp4l + phc2sys) or the external-PPS path,
//! retrying forever with backoff. Once the system clock is disciplined,
//! [`TimeSync::sync_time`] pulses the FPGA timestamp reset between two
//! PPS events and derives the whole-second offset to add to every FPGA
//! timestamp.

use clap::ValueEnum;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const NS_PER_SEC: i32 = 1_000_000_000;
const PPS_TIMEOUT_SECS: i64 = 3;

const PPS_DEVICE_PTP: u32 = 0;
const PPS_DEVICE_PPS: u32 = 1;

const I2C_DEVICE: &str = "/dev/i2c-2";

const CMD_STOP_NTP: &str = "/bin/systemctl stop ntpd ntpdate";
const CMD_SET_MUX_TO_PTP: &str = "/usr/bin/gpioset 8 13=1";
const CMD_SET_MUX_TO_PPS: &str = "/usr/bin/gpioset 8 13=0";
const CMD_START_PTP4L: &str = "/bin/systemctl start ptp4l";
const CMD_CHECK_FOR_GM_CLOCK: &str =
    "/usr/sbin/pmc -u -b 0 \"get time_status_np\" | grep gmPresent | grep true";
const CMD_CHECK_FOR_PTP4L_CONVERGENCE: &str = "/usr/sbin/pmc -u -b 0 \"get time_status_np\" | grep master_offset | awk '{ print ($2 < 0.0 ? -$2 : $2) < 100000 }' | grep 1";
const CMD_START_PHC2SYS: &str = "/bin/systemctl start phc2sys";
const CMD_CHECK_FOR_SYSTEM_CLOCK_SYNC: &str =
    "/usr/bin/timedatectl status | grep \"System clock synchronized:\" | grep yes";
const CMD_CHECK_FOR_PPS1_PRESENT: &str =
    "/bin/grep -v \"0.000000000#0\" /sys/class/pps/pps1/assert";
const CMD_ENABLE_PTP_PPS: &str = "/bin/echo 1 > /sys/class/ptp/ptp0/pps_enable";
const CMD_DISABLE_PTP_PPS: &str = "/bin/echo 0 > /sys/class/ptp/ptp0/pps_enable";

const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const TIMESTAMP_RESET_INTERVAL: Duration = Duration::from_micros(1_001_000);

/// Failure-log backoff thresholds, in tries.
const BACKOFF_TRIES: [u32; 9] = [1, 2, 5, 10, 60, 120, 300, 600, 3600];

// FPGA register fields, written over i2c.
const TSTAMP_SYNC_AUX_EN_OFFSET: u16 = 0x840d;
const TSTAMP_SYNC_AUX_EN_POS: u8 = 3;
const TSTAMP_SYNC_AUX_EN_MASK: u8 = 0x08;
const SCAN_TSTAMP_ENABLE_OFFSET: u16 = 0x8401;
const SCAN_TSTAMP_ENABLE_POS: u8 = 6;
const SCAN_TSTAMP_ENABLE_MASK: u8 = 0x40;

/// Startup time-synchronization mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StartupMode {
    /// Free-running FPGA clock; timestamps stay arbitrary.
    #[default]
    None,
    /// PTP (ptp4l + phc2sys) disciplines the clock and generates PPS.
    Ptp,
    /// An external 1PPS source together with NTP.
    Pps,
}

pub struct TimeSync {
    start_mode: StartupMode,
    initialized: Arc<AtomicBool>,
}

/// Run one shell command, mapping exit status to the C convention.
fn system(command: &str) -> i32 {
    match std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .status()
    {
        Ok(status) => status.code().unwrap_or_else(|| {
            error!(command, "command terminated by signal");
            -1
        }),
        Err(err) => {
            error!(command, %err, "failed to run command");
            -1
        }
    }
}

/// Repeat a command until it exits zero, logging exponentially less
/// often as tries accumulate.
fn wait_for_command(command: &str, name: &str) {
    let mut tries = 0u32;
    let mut wait_idx = 0usize;
    loop {
        let ret = system(command);
        tries += 1;
        if ret == 0 {
            info!(name, tries, "command succeeded");
            return;
        }
        if wait_idx < BACKOFF_TRIES.len() && tries >= BACKOFF_TRIES[wait_idx] {
            warn!(name, ret, tries, "command not yet successful");
            wait_idx += 1;
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
}

// Linux PPS and i2c-dev plumbing.

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct PpsKtime {
    sec: i64,
    nsec: i32,
    flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct PpsKinfo {
    assert_sequence: u32,
    clear_sequence: u32,
    assert_tu: PpsKtime,
    clear_tu: PpsKtime,
    current_mode: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct PpsFdata {
    info: PpsKinfo,
    timeout: PpsKtime,
}

const fn iowr(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (3 << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

const PPS_FETCH: libc::c_ulong = iowr(b'p', 0xa1, std::mem::size_of::<PpsFdata>());

const I2C_RDWR: libc::c_ulong = 0x0707;
const I2C_M_RD: u16 = 0x0001;

#[repr(C)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

#[repr(C)]
struct I2cRdwrIoctlData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

fn pps_fetch(fd: &OwnedFd) -> io::Result<PpsKtime> {
    let mut fdata = PpsFdata {
        timeout: PpsKtime {
            sec: PPS_TIMEOUT_SECS,
            nsec: 0,
            flags: 0,
        },
        ..Default::default()
    };
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), PPS_FETCH, &mut fdata) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fdata.info.assert_tu)
}

/// Read-modify-write one bit field of a sensor-head FPGA register.
fn set_fpga_field(
    i2c_fd: &OwnedFd,
    i2c_address: u16,
    offset: u16,
    pos: u8,
    mask: u8,
    value: u8,
) -> io::Result<()> {
    let mut reg_addr = [(offset >> 8) as u8, (offset & 0xff) as u8];
    let mut read_value = 0u8;

    let mut msgs = [
        I2cMsg {
            addr: i2c_address,
            flags: 0,
            len: reg_addr.len() as u16,
            buf: reg_addr.as_mut_ptr(),
        },
        I2cMsg {
            addr: i2c_address,
            flags: I2C_M_RD,
            len: 1,
            buf: &mut read_value,
        },
    ];
    let mut request = I2cRdwrIoctlData {
        msgs: msgs.as_mut_ptr(),
        nmsgs: 2,
    };
    if unsafe { libc::ioctl(i2c_fd.as_raw_fd(), I2C_RDWR, &mut request) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut write_buf = [
        (offset >> 8) as u8,
        (offset & 0xff) as u8,
        (read_value & !mask) | ((value << pos) & mask),
    ];
    let mut msg = I2cMsg {
        addr: i2c_address,
        flags: 0,
        len: write_buf.len() as u16,
        buf: write_buf.as_mut_ptr(),
    };
    let mut request = I2cRdwrIoctlData {
        msgs: &mut msg,
        nmsgs: 1,
    };
    if unsafe { libc::ioctl(i2c_fd.as_raw_fd(), I2C_RDWR, &mut request) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn open_fd(path: &str) -> io::Result<OwnedFd> {
    Ok(std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?
        .into())
}

impl TimeSync {
    /// Start the bootstrap task matching the startup mode. The task is
    /// detached; it flips the `initialized` flag once the OS side is
    /// ready.
    pub fn new(start_mode: StartupMode) -> TimeSync {
        let initialized = Arc::new(AtomicBool::new(false));
        match start_mode {
            StartupMode::None => {
                initialized.store(true, Ordering::Release);
                info!("no time synchronization requested, using the free-running FPGA clock");
            }
            StartupMode::Ptp => {
                let flag = initialized.clone();
                std::thread::Builder::new()
                    .name("timesync".into())
                    .spawn(move || {
                        wait_for_command(CMD_STOP_NTP, "stop_ntp");
                        wait_for_command(CMD_SET_MUX_TO_PTP, "set_mux_to_ptp");
                        wait_for_command(CMD_DISABLE_PTP_PPS, "disable_ptp_pps");
                        wait_for_command(CMD_START_PTP4L, "start_ptp4l");
                        wait_for_command(CMD_CHECK_FOR_GM_CLOCK, "check_for_gm_clock");
                        wait_for_command(
                            CMD_CHECK_FOR_PTP4L_CONVERGENCE,
                            "check_for_ptp4l_convergence",
                        );
                        wait_for_command(CMD_START_PHC2SYS, "start_phc2sys");
                        wait_for_command(
                            CMD_CHECK_FOR_SYSTEM_CLOCK_SYNC,
                            "check_for_system_clock_sync",
                        );
                        wait_for_command(CMD_ENABLE_PTP_PPS, "enable_ptp_pps");
                        info!("PTP time synchronization initialization successful");
                        flag.store(true, Ordering::Release);
                    })
                    .expect("spawning timesync bootstrap");
            }
            StartupMode::Pps => {
                let flag = initialized.clone();
                std::thread::Builder::new()
                    .name("timesync".into())
                    .spawn(move || {
                        wait_for_command(CMD_SET_MUX_TO_PPS, "set_mux_to_pps");
                        wait_for_command(CMD_CHECK_FOR_PPS1_PRESENT, "check_for_pps1_present");
                        wait_for_command(
                            CMD_CHECK_FOR_SYSTEM_CLOCK_SYNC,
                            "check_for_system_clock_sync",
                        );
                        info!("external PPS time synchronization initialization successful");
                        flag.store(true, Ordering::Release);
                    })
                    .expect("spawning timesync bootstrap");
            }
        }
        TimeSync {
            start_mode,
            initialized,
        }
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Reset the FPGA timestamps without deriving an offset; used when
    /// no synchronization was requested.
    fn sync_no_timesync(&self, i2c_address: u16) {
        let i2c = match open_fd(I2C_DEVICE) {
            Ok(fd) => fd,
            Err(err) => {
                error!(device = I2C_DEVICE, %err, "cannot open i2c device");
                return;
            }
        };

        // Auxiliary timestamp clock on, then pulse timestamping off and
        // on to reset the counters.
        let steps: [(u16, u8, u8, u8); 2] = [
            (
                TSTAMP_SYNC_AUX_EN_OFFSET,
                TSTAMP_SYNC_AUX_EN_POS,
                TSTAMP_SYNC_AUX_EN_MASK,
                1,
            ),
            (
                SCAN_TSTAMP_ENABLE_OFFSET,
                SCAN_TSTAMP_ENABLE_POS,
                SCAN_TSTAMP_ENABLE_MASK,
                0,
            ),
        ];
        for (offset, pos, mask, value) in steps {
            if let Err(err) = set_fpga_field(&i2c, i2c_address, offset, pos, mask, value) {
                error!(offset, %err, "i2c register write failed");
                return;
            }
        }
        std::thread::sleep(TIMESTAMP_RESET_INTERVAL);
        if let Err(err) = set_fpga_field(
            &i2c,
            i2c_address,
            SCAN_TSTAMP_ENABLE_OFFSET,
            SCAN_TSTAMP_ENABLE_POS,
            SCAN_TSTAMP_ENABLE_MASK,
            1,
        ) {
            error!(%err, "i2c register write failed");
        }
    }

    /// Restart the FPGA timestamp servo and return the whole-second UTC
    /// offset to add to FPGA timestamps. Zero means no offset (or a
    /// failure, already logged).
    pub fn sync_time(&self, i2c_address: u16) -> u64 {
        let pps_device = match self.start_mode {
            StartupMode::Ptp => PPS_DEVICE_PTP,
            StartupMode::Pps => PPS_DEVICE_PPS,
            StartupMode::None => {
                self.sync_no_timesync(i2c_address);
                return 0;
            }
        };

        let pps_name = format!("/dev/pps{}", pps_device);
        info!(pps_device = pps_name, "synchronizing time");

        let pps = match open_fd(&pps_name) {
            Ok(fd) => fd,
            Err(err) => {
                error!(device = pps_name, %err, "cannot open pps device");
                return 0;
            }
        };
        let i2c = match open_fd(I2C_DEVICE) {
            Ok(fd) => fd,
            Err(err) => {
                error!(device = I2C_DEVICE, %err, "cannot open i2c device");
                return 0;
            }
        };

        // Route the real PPS into the FPGA and stop timestamping.
        if set_fpga_field(
            &i2c,
            i2c_address,
            TSTAMP_SYNC_AUX_EN_OFFSET,
            TSTAMP_SYNC_AUX_EN_POS,
            TSTAMP_SYNC_AUX_EN_MASK,
            0,
        )
        .is_err()
            || set_fpga_field(
                &i2c,
                i2c_address,
                SCAN_TSTAMP_ENABLE_OFFSET,
                SCAN_TSTAMP_ENABLE_POS,
                SCAN_TSTAMP_ENABLE_MASK,
                0,
            )
            .is_err()
        {
            error!("FPGA timestamp setup failed");
            return 0;
        }

        // One PPS edge to align against, timestamping back on, then the
        // edge on which the FPGA actually resets.
        if let Err(err) = pps_fetch(&pps) {
            error!(%err, "pps fetch failed");
            return 0;
        }
        if set_fpga_field(
            &i2c,
            i2c_address,
            SCAN_TSTAMP_ENABLE_OFFSET,
            SCAN_TSTAMP_ENABLE_POS,
            SCAN_TSTAMP_ENABLE_MASK,
            1,
        )
        .is_err()
        {
            error!("FPGA timestamp enable failed");
            return 0;
        }
        let assert = match pps_fetch(&pps) {
            Ok(t) => t,
            Err(err) => {
                error!(%err, "second pps fetch failed");
                return 0;
            }
        };

        let mut offset = assert.sec as u64;
        // Round up when the PPS leads the second boundary.
        if assert.nsec > NS_PER_SEC / 2 {
            offset += 1;
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_timesync_initialized_immediately() {
        let sync = TimeSync::new(StartupMode::None);
        assert!(sync.initialized());
    }

    #[test]
    fn test_pps_fetch_ioctl_number() {
        // _IOWR('p', 0xa1, struct pps_fdata) with a 64-byte payload.
        assert_eq!(std::mem::size_of::<PpsFdata>(), 64);
        assert_eq!(PPS_FETCH, 0xc040_70a1);
    }

    #[test]
    fn test_system_exit_codes() {
        assert_eq!(system("true"), 0);
        assert_ne!(system("false"), 0);
    }
}
