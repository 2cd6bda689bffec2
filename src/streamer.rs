// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Single-client framed TCP transport for one output stream.
//!
//! A non-blocking listener accepts at the start of each chunk cycle; a
//! new connection displaces the current client (no fan-out). The socket
//! is tuned for fail-fast streaming: no Nagle, a requested minimum send
//! buffer, aggressive keepalive, and a bounded user timeout. Payloads
//! are corked per chunk and each is prefixed with the 16-byte framing
//! header.

use crate::wire;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, info};

const TCP_SERVE_BACKLOG: i32 = 20;
// Keepalive: idle 1 s, interval 11 s, 3 probes -- roughly 34 s of idle
// tolerance; user timeout bounds unacknowledged sends similarly.
const KEEPIDLE_SECS: libc::c_int = 1;
const KEEPINTVL_SECS: libc::c_int = 11;
const KEEPCNT: libc::c_int = 3;
const USER_TIMEOUT_MS: libc::c_int = 30_000;
const TCP_USER_TIMEOUT: libc::c_int = 18;

fn setsockopt(fd: i32, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct TcpFramedStreamer {
    listener: TcpListener,
    client: Option<TcpStream>,
    req_sndbuf: usize,
    prefix: &'static str,
    scratch: Vec<u8>,
}

impl TcpFramedStreamer {
    pub fn new(port: u16, min_sndbuf: usize, prefix: &'static str) -> io::Result<TcpFramedStreamer> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        // Deepen the backlog beyond the std default.
        unsafe {
            libc::listen(listener.as_raw_fd(), TCP_SERVE_BACKLOG);
        }
        Ok(TcpFramedStreamer {
            listener,
            client: None,
            req_sndbuf: min_sndbuf,
            prefix,
            scratch: Vec::new(),
        })
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Poll for a new connection; a fresh client displaces the old one.
    /// Returns true when a new client was installed.
    pub fn accept_new_connection(&mut self) -> bool {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
            Err(err) => {
                error!(prefix = self.prefix, %err, "accept failed");
                return false;
            }
        };

        if self.client.is_some() {
            self.close_connection();
        }
        info!(prefix = self.prefix, %peer, "TCP client connected");

        let fd = stream.as_raw_fd();
        // Nagle off by default; TCP_CORK overrides during chunk sends.
        if let Err(err) = stream.set_nodelay(true) {
            error!(prefix = self.prefix, %err, "setting TCP_NODELAY failed");
        }
        if self.req_sndbuf != 0 {
            if let Err(err) = setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                self.req_sndbuf as libc::c_int,
            ) {
                error!(prefix = self.prefix, %err, "setting SO_SNDBUF failed");
            }
        }
        for (level, name, value) in [
            (libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1),
            (libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, KEEPIDLE_SECS),
            (libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, KEEPINTVL_SECS),
            (libc::IPPROTO_TCP, libc::TCP_KEEPCNT, KEEPCNT),
            (libc::IPPROTO_TCP, TCP_USER_TIMEOUT, USER_TIMEOUT_MS),
        ] {
            if let Err(err) = setsockopt(fd, level, name, value) {
                error!(prefix = self.prefix, name, %err, "setsockopt failed");
            }
        }

        self.client = Some(stream);
        true
    }

    fn close_connection(&mut self) {
        if let Some(client) = self.client.take() {
            if let Ok(peer) = client.peer_addr() {
                info!(prefix = self.prefix, %peer, "TCP connection closed");
            } else {
                info!(prefix = self.prefix, "TCP connection closed");
            }
        }
    }

    /// Cork or uncork the client socket around a chunk of sends.
    pub fn cork(&mut self, on: bool) {
        if let Some(client) = &self.client {
            if let Err(err) = setsockopt(
                client.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_CORK,
                libc::c_int::from(on),
            ) {
                error!(prefix = self.prefix, %err, "setting TCP_CORK failed");
            }
        }
    }

    /// Send one framed payload; loops until fully written. Connection
    /// resets close the client silently; other errors are logged.
    pub fn send_framed(&mut self, payload: &[u8]) {
        if self.client.is_none() {
            return;
        }

        self.scratch.clear();
        wire::write_framing_header(&mut self.scratch, payload.len());
        self.scratch.extend_from_slice(payload);

        let result = self
            .client
            .as_mut()
            .unwrap()
            .write_all(&self.scratch);
        if let Err(err) = result {
            match err.kind() {
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                    debug!(prefix = self.prefix, "client went away");
                    self.close_connection();
                }
                _ => error!(prefix = self.prefix, %err, "send failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_accept_and_framed_send() {
        let mut streamer = TcpFramedStreamer::new(0, 0, "test").unwrap();
        let port = streamer.listener.local_addr().unwrap().port();

        assert!(!streamer.accept_new_connection());

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // The listener is non-blocking; poll briefly.
        let mut accepted = false;
        for _ in 0..100 {
            if streamer.accept_new_connection() {
                accepted = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(accepted);
        assert!(streamer.has_client());

        streamer.send_framed(b"hello");
        let mut buf = [0u8; wire::FRAMING_HEADER_SIZE + 5];
        client.read_exact(&mut buf).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, 5);
        assert_eq!(&buf[wire::FRAMING_HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_new_client_displaces_old() {
        let mut streamer = TcpFramedStreamer::new(0, 0, "test").unwrap();
        let port = streamer.listener.local_addr().unwrap().port();

        let _first = TcpStream::connect(("127.0.0.1", port)).unwrap();
        for _ in 0..100 {
            if streamer.accept_new_connection() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let mut second = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut accepted = false;
        for _ in 0..100 {
            if streamer.accept_new_connection() {
                accepted = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(accepted);

        streamer.send_framed(b"x");
        let mut buf = [0u8; wire::FRAMING_HEADER_SIZE + 1];
        second.read_exact(&mut buf).unwrap();
        assert_eq!(buf[wire::FRAMING_HEADER_SIZE], b'x');
    }
}
