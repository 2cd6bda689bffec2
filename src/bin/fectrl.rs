// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Command-line TCP client for the front end control port.
//!
//! Encodes exactly one control byte, sends it to the local control
//! port, and verifies the echo. Exits 0 on success, 1 on a bad
//! invocation or any transport failure.

use clap::Parser;
use edgefirst_depthpub::control::{
    FEC_FORMAT_SHIFT, FEC_RELOAD_CAL_DATA, FEC_SET_DEBUG_LEVEL, FEC_START_RAW_STREAMING,
    FEC_START_STREAMING, FEC_STOP_STREAMING, FEC_SUSPEND_RAW_STREAMING, FEC_SYNC_TIME,
    LISTEN_PORT,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::exit;

const HIGHEST_DEBUG_LEVEL: u8 = 7;
const HIGHEST_HEAD: u8 = 3;
const HIGHEST_FORMAT: u8 = 15;

#[derive(Parser, Debug)]
#[command(author, version, about = "front end control client", long_about = None)]
struct Args {
    /// Set the debug level (0 is info, higher is more verbose).
    #[arg(short = 'd', long)]
    debug: Option<u8>,

    /// Start streaming on the given head; requires --format.
    #[arg(short = 's', long)]
    start: Option<u8>,

    /// Video format index for --start.
    #[arg(short = 'f', long)]
    format: Option<u8>,

    /// End streaming on the given head.
    #[arg(short = 'e', long)]
    end: Option<u8>,

    /// Reload calibration data on the given head.
    #[arg(short = 'r', long)]
    reload: Option<u8>,

    /// Start (or unsuspend) raw streaming on the given head.
    #[arg(short = 'R', long)]
    raw: Option<u8>,

    /// Suspend raw streaming on the given head.
    #[arg(short = 'S', long)]
    suspend: Option<u8>,

    /// Synchronize time on the given head's next session.
    #[arg(short = 't', long)]
    timesync: Option<u8>,

    /// Control port to connect to.
    #[arg(short = 'l', long, default_value_t = LISTEN_PORT)]
    local_port: u16,
}

fn encode(args: &Args) -> Option<u8> {
    let options = [
        args.start, args.end, args.debug, args.reload, args.raw, args.suspend, args.timesync,
    ];
    if options.iter().flatten().count() != 1 {
        return None;
    }

    if let Some(head) = args.start {
        let format = args.format?;
        if head > HIGHEST_HEAD || format > HIGHEST_FORMAT {
            return None;
        }
        return Some(FEC_START_STREAMING | (format << FEC_FORMAT_SHIFT) | head);
    }
    if args.format.is_some() {
        return None; // --format only makes sense with --start
    }

    let simple = [
        (args.end, FEC_STOP_STREAMING, HIGHEST_HEAD),
        (args.reload, FEC_RELOAD_CAL_DATA, HIGHEST_HEAD),
        (args.debug, FEC_SET_DEBUG_LEVEL, HIGHEST_DEBUG_LEVEL),
        (args.raw, FEC_START_RAW_STREAMING, HIGHEST_HEAD),
        (args.suspend, FEC_SUSPEND_RAW_STREAMING, HIGHEST_HEAD),
        (args.timesync, FEC_SYNC_TIME, HIGHEST_HEAD),
    ];
    for (value, base, highest) in simple {
        if let Some(value) = value {
            if value > highest {
                return None;
            }
            return Some(base | value);
        }
    }
    None
}

fn main() {
    let args = Args::parse();
    let command = match encode(&args) {
        Some(command) => command,
        None => {
            eprintln!("exactly one command option must be given; see --help");
            exit(1);
        }
    };

    let mut stream = match TcpStream::connect(("127.0.0.1", args.local_port)) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("connect: {err}");
            exit(1);
        }
    };

    if let Err(err) = stream.write_all(&[command]) {
        eprintln!("send: {err}");
        exit(1);
    }

    let mut received = [0u8; 1];
    if let Err(err) = stream.read_exact(&mut received) {
        eprintln!("recv: {err}");
        exit(1);
    }
    if received[0] != command {
        eprintln!(
            "received mismatch: command={command:#04x} received={:#04x}",
            received[0]
        );
        exit(1);
    }
}
