//! Stream socket client built on `Transmit`
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::net::Ipv6Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use edge::bridge::socket::BridgeSockAddr;
use log::{error, info};

use crate::Error;
use crate::transmit::Transmit;

/// A connected stream socket
pub struct SocketClient {
    connection: Option<OwnedFd>,
    transmit:   Transmit,
}

impl SocketClient {

    pub fn new() -> Self {
        Self{connection: None, transmit: Transmit::new()}
    }

    /// Connect to an IPv6 server
    ///
    /// # Inputs
    /// * 'server' is the textual IPv6 address
    /// * 'port' is the server port
    ///
    /// # Returns
    ///
    /// Ok() when connected, or an error describing the failed step

    pub fn connect_inet6(&mut self, server: &str, port: u16) -> Result<(), Error> {
        let addr: Ipv6Addr = server.parse().map_err(|_| {
            error!("client address parse error: {}", server);
            Error::posix(libc::EINVAL, "inet_pton error")
        })?;

        let fd = self.open(libc::AF_INET6)?;
        let target = BridgeSockAddr::Inet6{port:     port,
                                           flowinfo: 0,
                                           addr:     addr.octets(),
                                           scope_id: 0};
        Self::connect(fd, &target)
    }

    /// Connect to a unix domain socket server
    pub fn connect_unix(&mut self, path: &str) -> Result<(), Error> {
        let fd = self.open(libc::AF_UNIX)?;
        let target = BridgeSockAddr::Unix{path: path.as_bytes().to_vec()};
        Self::connect(fd, &target)
    }

    fn open(&mut self, family: i32) -> Result<RawFd, Error> {
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            error!("client socket error");
            return Err(Error::posix(nix::errno::errno(), "socket error"));
        }

        self.connection = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(fd)
    }

    fn connect(fd: RawFd, target: &BridgeSockAddr) -> Result<(), Error> {
        let (storage, len) = target.to_host()?;
        let rc = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc < 0 {
            error!("client connect timeout");
            return Err(Error::posix(nix::errno::errno(), "connect timeout"));
        }

        Ok(())
    }

    fn fd(&self) -> Result<RawFd, Error> {
        self.connection.as_ref()
                       .map(|fd| fd.as_raw_fd())
                       .ok_or_else(|| Error::FailedPrecondition("client not connected".into()))
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<(), Error> {
        self.transmit.read(self.fd()?, buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<(), Error> {
        self.transmit.write(self.fd()?, buf)
    }

    /// Read then echo back `len` bytes, `rounds` times
    pub fn roundtrip(&self, len: usize, rounds: usize) -> Result<(), Error> {
        let mut buf = vec![0u8; len];
        for _ in 0 .. rounds {
            self.read(&mut buf)?;
            self.write(&buf)?;
        }
        Ok(())
    }

    pub fn log_io_stats(&self) {
        info!("client made {} calls to write", self.transmit.write_count());
        info!("client made {} calls to read", self.transmit.read_count());
    }
}

impl Default for SocketClient {
    fn default() -> Self {
        Self::new()
    }
}
