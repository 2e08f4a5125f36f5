//! Reliable transfers over file descriptors
//!
//! `Transmit` reads and writes exact byte counts, retrying transient
//! interruptions and accumulating short transfers. A zero-byte read means
//! the peer closed the connection and is reported as
//! `Error::ConnectionClosed`.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::errno::Errno;

use crate::Error;

/// Raw descriptor operations used by `Transmit`
pub trait RawIo: Send + Sync {
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize, Errno>;

    /// # Safety
    ///
    /// All pointers in `msg` must be valid for the call
    unsafe fn sendmsg(&self, fd: RawFd, msg: *const libc::msghdr, flags: i32)
                      -> Result<usize, Errno>;

    /// # Safety
    ///
    /// All pointers in `msg` must be valid for writes of their lengths
    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut libc::msghdr, flags: i32)
                      -> Result<usize, Errno>;
}

/// The operating system's descriptor calls
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemIo;

impl RawIo for SystemIo {
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
        nix::unistd::read(fd, buf)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
        nix::unistd::write(fd, buf)
    }

    unsafe fn sendmsg(&self, fd: RawFd, msg: *const libc::msghdr, flags: i32)
                      -> Result<usize, Errno> {
        Errno::result(libc::sendmsg(fd, msg, flags)).map(|n| n as usize)
    }

    unsafe fn recvmsg(&self, fd: RawFd, msg: *mut libc::msghdr, flags: i32)
                      -> Result<usize, Errno> {
        Errno::result(libc::recvmsg(fd, msg, flags)).map(|n| n as usize)
    }
}

/// Exact-length reads and writes with call statistics
#[derive(Debug, Default)]
pub struct Transmit<I: RawIo = SystemIo> {
    io:          I,
    read_count:  AtomicUsize,
    write_count: AtomicUsize,
}

impl Transmit<SystemIo> {
    pub fn new() -> Self {
        Self::with_io(SystemIo)
    }
}

impl<I: RawIo> Transmit<I> {

    pub fn with_io(io: I) -> Self {
        Self{io:          io,
             read_count:  AtomicUsize::new(0),
             write_count: AtomicUsize::new(0)}
    }

    /// Fill `buf` completely from `fd`
    ///
    /// # Inputs
    /// * 'fd' is a blocking descriptor
    /// * 'buf' receives exactly `buf.len()` bytes
    ///
    /// # Returns
    ///
    /// Ok() when the buffer is full, Err(Error::ConnectionClosed) if the peer
    /// closed the connection first, or Err(Error::Posix) for other failures

    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            match self.io.read(fd, &mut buf[done ..]) {
                Ok(0) => {
                    return Err(Error::ConnectionClosed);
                },
                Ok(n) => {
                    done += n;
                    self.read_count.fetch_add(1, Ordering::Relaxed);
                },
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(errno) => return Err(Error::posix(errno as i32, "read error")),
            }
        }

        Ok(())
    }

    /// Write all of `buf` to `fd`
    pub fn write(&self, fd: RawFd, buf: &[u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            match self.io.write(fd, &buf[done ..]) {
                Ok(0) => {
                    return Err(Error::posix(libc::EIO, "write made no progress"));
                },
                Ok(n) => {
                    done += n;
                    self.write_count.fetch_add(1, Ordering::Relaxed);
                },
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(errno) => return Err(Error::posix(errno as i32, "write error")),
            }
        }

        Ok(())
    }

    /// Pass-through `sendmsg`
    ///
    /// # Safety
    ///
    /// All pointers in `msg` must be valid for the call
    pub unsafe fn send_msg(&self, fd: RawFd, msg: &libc::msghdr, flags: i32)
                           -> Result<usize, Error> {
        self.io.sendmsg(fd, msg, flags)
               .map_err(|errno| Error::posix(errno as i32, "sendmsg error"))
    }

    /// Pass-through `recvmsg`
    ///
    /// # Safety
    ///
    /// All pointers in `msg` must be valid for writes of their lengths
    pub unsafe fn recv_msg(&self, fd: RawFd, msg: &mut libc::msghdr, flags: i32)
                           -> Result<usize, Error> {
        self.io.recvmsg(fd, msg, flags)
               .map_err(|errno| Error::posix(errno as i32, "recvmsg error"))
    }

    /// Number of successful read calls since the last reset
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Number of successful write calls since the last reset
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.read_count.store(0, Ordering::Relaxed);
        self.write_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::close;

    /// Interrupts every other call and moves at most three bytes at a time
    #[derive(Default)]
    struct FlakyIo {
        fail: AtomicBool,
    }

    impl FlakyIo {
        fn interrupt(&self) -> bool {
            !self.fail.fetch_xor(true, Ordering::Relaxed)
        }
    }

    impl RawIo for FlakyIo {
        fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
            if self.interrupt() {
                return Err(Errno::EINTR);
            }
            let len = buf.len().min(3);
            SystemIo.read(fd, &mut buf[.. len])
        }

        fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
            if self.interrupt() {
                return Err(Errno::EINTR);
            }
            SystemIo.write(fd, &buf[.. buf.len().min(3)])
        }

        unsafe fn sendmsg(&self, fd: RawFd, msg: *const libc::msghdr, flags: i32)
                          -> Result<usize, Errno> {
            SystemIo.sendmsg(fd, msg, flags)
        }

        unsafe fn recvmsg(&self, fd: RawFd, msg: *mut libc::msghdr, flags: i32)
                          -> Result<usize, Errno> {
            SystemIo.recvmsg(fd, msg, flags)
        }
    }

    fn pair() -> (RawFd, RawFd) {
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).unwrap()
    }

    #[test]
    fn interrupted_short_transfers_deliver_every_byte() {
        let (a, b) = pair();
        let transmit = Transmit::with_io(FlakyIo::default());
        let payload: Vec<u8> = (0 .. 100u8).collect();

        transmit.write(a, &payload).unwrap();
        let mut received = vec![0u8; payload.len()];
        transmit.read(b, &mut received).unwrap();

        assert_eq!(received, payload);
        assert_eq!(transmit.write_count(), 34);
        assert_eq!(transmit.read_count(), 34);

        transmit.reset();
        assert_eq!(transmit.read_count(), 0);
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn closed_peer_is_reported() {
        let (a, b) = pair();
        close(a).unwrap();
        let transmit = Transmit::new();
        let mut buf = [0u8; 8];
        assert_eq!(transmit.read(b, &mut buf), Err(Error::ConnectionClosed));
        close(b).unwrap();
    }

    #[test]
    fn bad_descriptor_is_not_retried() {
        let transmit = Transmit::new();
        let err = transmit.write(-1, b"x").unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
    }

    #[test]
    fn message_calls_pass_through() {
        let (a, b) = pair();
        let transmit = Transmit::new();

        let mut out = *b"hello";
        let mut iov = libc::iovec{iov_base: out.as_mut_ptr() as *mut _, iov_len: out.len()};
        let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
        msg.msg_iov    = &mut iov;
        msg.msg_iovlen = 1;
        assert_eq!(unsafe { transmit.send_msg(a, &msg, 0) }.unwrap(), 5);

        let mut input = [0u8; 5];
        let mut iov = libc::iovec{iov_base: input.as_mut_ptr() as *mut _, iov_len: input.len()};
        let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
        msg.msg_iov    = &mut iov;
        msg.msg_iovlen = 1;
        assert_eq!(unsafe { transmit.recv_msg(b, &mut msg, 0) }.unwrap(), 5);
        assert_eq!(&input, b"hello");

        close(a).unwrap();
        close(b).unwrap();
    }
}
