//! Host-call API for calling the host application from the enclave
//!
//! `HostCalls::call` is the raw crossing. The remaining methods are stubs
//! that follow the POSIX convention: they return -1 (or `None`) on failure
//! and leave the reason in a thread-local errno, read with `errno()`.
//! A crossing that fails in transport, or a reply that cannot be decoded,
//! aborts the enclave.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::cell::Cell;
use std::ffi::CString;
use std::sync::Arc;

use edge::alloc::BoundaryParams;
use edge::bridge::cpuset::CpuSet;
use edge::bridge::fs::{from_bridge_fcntl_cmd, from_bridge_fd_flags, from_bridge_file_mode,
                       from_bridge_file_status_flags, to_bridge_fd_flags,
                       to_bridge_file_status_flags, BridgeStat, BRIDGE_F_GETFD, BRIDGE_F_GETFL,
                       BRIDGE_F_SETFD, BRIDGE_F_SETFL};
use edge::bridge::signal::{from_bridge_signal, BridgeSignalHandler};
use edge::bridge::socket::{from_bridge_family, from_bridge_socket_type, BridgeSockAddr};
use edge::bridge::sys::{from_bridge_errno, BridgePassWd, BridgeUtsName};
use edge::bridge::wait::{BridgeRUsage, BridgeWStatus};
use edge::bridge::BridgeTimespec;
use edge::message::{MessageReader, MessageWriter, Scalar};
use edge::ocall::{encode_syscall, sysno, HostExit, Selector, SyscallArg};

pub use edge::ocall::CallID;

use crate::{enclave_abort, Error};

thread_local! {
    static ERRNO: Cell<i32> = Cell::new(0);
}

/// Error code of the last failed stub on this thread
pub fn errno() -> i32 {
    ERRNO.with(|e| e.get())
}

pub fn set_errno(value: i32) {
    ERRNO.with(|e| e.set(value));
}

/// Message received with `HostCalls::recvmsg`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub data:    Vec<u8>,
    /// Source address, if the socket reported one
    pub address: Option<BridgeSockAddr>,
    pub flags:   i32,
}

/// Handle for calling out of one enclave
#[derive(Clone)]
pub struct HostCalls {
    host: Arc<dyn HostExit>,
}

impl HostCalls {

    pub fn new(host: Arc<dyn HostExit>) -> Self {
        Self{host: host}
    }

    /// Cross to the host
    ///
    /// # Inputs
    /// * 'selector' is a named call ID or `SYSCALL_BASE + sysno`
    /// * 'input' holds the arguments
    ///
    /// # Returns
    ///
    /// The decoded reply, or the error the host reported. The argument
    /// buffer is freed here whether or not the host took it.

    pub fn call(&self, selector: u64, input: &MessageWriter) -> Result<MessageReader, Error> {
        let mut params = BoundaryParams::from_writer(input)?;
        let status = self.host.exit(selector, &mut params);
        params.input = None;

        let mut output = params.take_output()?;
        if !status.is_ok() {
            return Err(Error::decode(status, &mut output));
        }
        Ok(output)
    }

    /* A stub cannot report a broken boundary through errno */
    fn call_or_abort<T, F>(&self, what: &str, selector: u64, input: &MessageWriter, parse: F) -> T
        where F: FnOnce(&mut MessageReader) -> Result<T, Error> {

        let result = self.call(selector, input)
                         .and_then(|mut reply| parse(&mut reply));
        return match result {
            Ok(value) => value,
            Err(err)  => enclave_abort(&format!("host call {} failed: {}", what, err)),
        };
    }

    fn named<T, F>(&self, id: CallID, input: &MessageWriter, parse: F) -> T
        where F: FnOnce(&mut MessageReader) -> Result<T, Error> {
        self.call_or_abort(&format!("{:?}", id), CallID::as_u64(id), input, parse)
    }

    /// Generic system call
    ///
    /// Scalar arguments are passed to the host as they are.
    ///
    /// # Inputs
    /// * 'number' is the bridge system call number
    /// * 'args' are the tagged arguments
    ///
    /// # Returns
    ///
    /// The result and the contents of every output buffer, in argument
    /// order. errno is set when the result is negative.

    pub fn syscall(&self, number: u64, args: &[SyscallArg]) -> (i64, Vec<Vec<u8>>) {
        let input = match encode_syscall(args) {
            Ok(input) => input,
            Err(err)  => {
                set_errno(err.errno());
                return (-1, Vec::new());
            },
        };
        let outputs = args.iter().filter(|a| a.is_output()).count();

        self.call_or_abort(&format!("syscall {}", number),
                           Selector::Syscall(number).as_u64(),
                           &input,
                           |reply| {
            let rc = result::<i64>(reply, |rc| rc < 0)?;
            let mut buffers = Vec::with_capacity(outputs);
            if reply.has_next() {
                for _ in 0 .. outputs {
                    buffers.push(reply.next_bytes()?);
                }
            }
            Ok((rc, buffers))
        })
    }

    fn syscall_scalar(&self, number: u64, args: &[i64]) -> i64 {
        let args: Vec<SyscallArg> = args.iter().map(|a| SyscallArg::Scalar(*a)).collect();
        self.syscall(number, &args).0
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> isize {
        let (rc, out) = self.syscall(sysno::READ, &[SyscallArg::Scalar(fd as i64),
                                                    SyscallArg::Out(buf.len()),
                                                    SyscallArg::Scalar(buf.len() as i64)]);
        if rc > 0 {
            copy_out(buf, &out, rc as usize);
        }
        rc as isize
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> isize {
        self.syscall(sysno::WRITE, &[SyscallArg::Scalar(fd as i64),
                                     SyscallArg::In(buf.to_vec()),
                                     SyscallArg::Scalar(buf.len() as i64)]).0 as isize
    }

    /// Open a file relative to the host's working directory
    ///
    /// `flags` are bridge `O_*` flags and `mode` a bridge file mode.
    pub fn open(&self, path: &str, flags: i32, mode: u32) -> i32 {
        let path = match c_path(path) {
            Some(path) => path,
            None       => return -1,
        };
        let flags = from_bridge_file_status_flags(flags);
        let mode = from_bridge_file_mode(mode);
        self.syscall(sysno::OPENAT, &[SyscallArg::Scalar(libc::AT_FDCWD as i64),
                                      SyscallArg::In(path),
                                      SyscallArg::Scalar(flags as i64),
                                      SyscallArg::Scalar(mode as i64)]).0 as i32
    }

    pub fn close(&self, fd: i32) -> i32 {
        self.syscall_scalar(sysno::CLOSE, &[fd as i64]) as i32
    }

    pub fn lseek(&self, fd: i32, offset: i64, whence: i32) -> i64 {
        self.syscall_scalar(sysno::LSEEK, &[fd as i64, offset, whence as i64])
    }

    pub fn fsync(&self, fd: i32) -> i32 {
        self.syscall_scalar(sysno::FSYNC, &[fd as i64]) as i32
    }

    pub fn unlink(&self, path: &str) -> i32 {
        let path = match c_path(path) {
            Some(path) => path,
            None       => return -1,
        };
        self.syscall(sysno::UNLINKAT, &[SyscallArg::Scalar(libc::AT_FDCWD as i64),
                                        SyscallArg::In(path),
                                        SyscallArg::Scalar(0)]).0 as i32
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> i32 {
        let path = match c_path(path) {
            Some(path) => path,
            None       => return -1,
        };
        self.syscall(sysno::MKDIRAT, &[SyscallArg::Scalar(libc::AT_FDCWD as i64),
                                       SyscallArg::In(path),
                                       SyscallArg::Scalar(from_bridge_file_mode(mode) as i64)]).0 as i32
    }

    pub fn fstat(&self, fd: i32, stat: &mut BridgeStat) -> i32 {
        let size = core::mem::size_of::<libc::stat>();
        let (rc, out) = self.syscall(sysno::FSTAT, &[SyscallArg::Scalar(fd as i64),
                                                     SyscallArg::Out(size)]);
        if rc == 0 {
            match out.first().map(|bytes| BridgeStat::from_host_bytes(bytes)) {
                Some(Ok(host)) => *stat = host,
                _ => enclave_abort("fstat reply has no stat buffer"),
            }
        }
        rc as i32
    }

    /// `cmd` is a bridge `F_*` command. Flag arguments and flag results
    /// of the get/set commands are bridge flags.
    pub fn fcntl(&self, fd: i32, cmd: i32, arg: i64) -> i32 {
        let host_cmd = from_bridge_fcntl_cmd(cmd);
        if host_cmd < 0 {
            set_errno(libc::EINVAL);
            return -1;
        }
        let arg = match cmd {
            BRIDGE_F_SETFL => from_bridge_file_status_flags(arg as i32) as i64,
            BRIDGE_F_SETFD => from_bridge_fd_flags(arg as i32) as i64,
            _              => arg,
        };

        let rc = self.syscall_scalar(sysno::FCNTL, &[fd as i64, host_cmd as i64, arg]) as i32;
        if rc < 0 {
            return rc;
        }
        return match cmd {
            BRIDGE_F_GETFL => to_bridge_file_status_flags(rc),
            BRIDGE_F_GETFD => to_bridge_fd_flags(rc),
            _              => rc,
        };
    }

    /// `flags` are bridge `O_CLOEXEC`/`O_NONBLOCK` flags
    pub fn pipe2(&self, fds: &mut [i32; 2], flags: i32) -> i32 {
        let flags = from_bridge_file_status_flags(flags);
        let (rc, out) = self.syscall(sysno::PIPE2, &[SyscallArg::Out(8),
                                                     SyscallArg::Scalar(flags as i64)]);
        if rc == 0 {
            match out.first() {
                Some(b) if b.len() == 8 => {
                    fds[0] = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    fds[1] = i32::from_le_bytes([b[4], b[5], b[6], b[7]]);
                },
                _ => enclave_abort("pipe2 reply has no descriptors"),
            }
        }
        rc as i32
    }

    pub fn getpid(&self) -> i32 {
        self.syscall_scalar(sysno::GETPID, &[]) as i32
    }

    pub fn getppid(&self) -> i32 {
        self.syscall_scalar(sysno::GETPPID, &[]) as i32
    }

    /// Send a bridge signal to a host process
    pub fn kill(&self, pid: i32, signum: i32) -> i32 {
        let host = from_bridge_signal(signum);
        if host < 0 {
            set_errno(libc::EINVAL);
            return -1;
        }
        self.syscall_scalar(sysno::KILL, &[pid as i64, host as i64]) as i32
    }

    /// Create a socket from a bridge family and bridge type
    pub fn socket(&self, family: i32, socket_type: i32, protocol: i32) -> i32 {
        let host_family = from_bridge_family(family);
        let host_type = from_bridge_socket_type(socket_type);
        if host_family < 0 || host_type < 0 {
            set_errno(libc::EAFNOSUPPORT);
            return -1;
        }
        self.syscall_scalar(sysno::SOCKET, &[host_family as i64, host_type as i64,
                                             protocol as i64]) as i32
    }

    fn address_syscall(&self, number: u64, fd: i32, addr: &BridgeSockAddr) -> i32 {
        let bytes = match host_address_bytes(addr) {
            Ok(bytes) => bytes,
            Err(err)  => {
                set_errno(err.errno());
                return -1;
            },
        };
        let len = bytes.len() as i64;
        self.syscall(number, &[SyscallArg::Scalar(fd as i64),
                               SyscallArg::In(bytes),
                               SyscallArg::Scalar(len)]).0 as i32
    }

    pub fn bind(&self, fd: i32, addr: &BridgeSockAddr) -> i32 {
        self.address_syscall(sysno::BIND, fd, addr)
    }

    pub fn connect(&self, fd: i32, addr: &BridgeSockAddr) -> i32 {
        self.address_syscall(sysno::CONNECT, fd, addr)
    }

    pub fn listen(&self, fd: i32, backlog: i32) -> i32 {
        self.syscall_scalar(sysno::LISTEN, &[fd as i64, backlog as i64]) as i32
    }

    /// `how` is a host value
    pub fn shutdown(&self, fd: i32, how: i32) -> i32 {
        self.syscall_scalar(sysno::SHUTDOWN, &[fd as i64, how as i64]) as i32
    }

    pub fn send(&self, fd: i32, buf: &[u8], flags: i32) -> isize {
        self.syscall(sysno::SENDTO, &[SyscallArg::Scalar(fd as i64),
                                      SyscallArg::In(buf.to_vec()),
                                      SyscallArg::Scalar(buf.len() as i64),
                                      SyscallArg::Scalar(flags as i64),
                                      SyscallArg::Scalar(0),
                                      SyscallArg::Scalar(0)]).0 as isize
    }

    pub fn nanosleep(&self, duration: &BridgeTimespec) -> i32 {
        let ts = duration.to_host();
        let bytes = unsafe { as_bytes(&ts) }.to_vec();
        self.syscall(sysno::NANOSLEEP, &[SyscallArg::In(bytes), SyscallArg::Scalar(0)]).0 as i32
    }

    pub fn sched_yield(&self) -> i32 {
        self.syscall_scalar(sysno::SCHED_YIELD, &[]) as i32
    }

    pub fn sched_getaffinity(&self, pid: i32, set: &mut CpuSet) -> i32 {
        let size = core::mem::size_of::<libc::cpu_set_t>();
        let (rc, out) = self.syscall(sysno::SCHED_GETAFFINITY,
                                     &[SyscallArg::Scalar(pid as i64),
                                       SyscallArg::Scalar(size as i64),
                                       SyscallArg::Out(size)]);
        if rc < 0 {
            return -1;
        }
        match out.first().map(|bytes| CpuSet::from_host_bytes(bytes)) {
            Some(Ok(host)) => *set = host,
            _ => enclave_abort("sched_getaffinity reply has no cpu set"),
        }
        0
    }

    pub fn isatty(&self, fd: i32) -> i32 {
        let mut input = MessageWriter::new();
        input.push(fd);
        self.named(CallID::IsAtty, &input, |reply| result::<i32>(reply, |rc| rc == 0))
    }

    pub fn usleep(&self, usec: u32) -> i32 {
        let mut input = MessageWriter::new();
        input.push(usec);
        self.named(CallID::USleep, &input, |reply| result::<i32>(reply, |rc| rc < 0))
    }

    /// `name` is a bridge `_SC_*` value
    pub fn sysconf(&self, name: i32) -> i64 {
        let mut input = MessageWriter::new();
        input.push(name);
        self.named(CallID::SysConf, &input, |reply| result::<i64>(reply, |rc| rc < 0))
    }

    /// Resize a block of host memory. Returns 0 on failure.
    pub fn realloc(&self, ptr: u64, size: u64) -> u64 {
        let mut input = MessageWriter::new();
        input.push(ptr);
        input.push(size);
        self.named(CallID::Realloc, &input, |reply| result::<u64>(reply, |rc| rc == 0))
    }

    pub fn sleep(&self, seconds: u32) -> u32 {
        let mut input = MessageWriter::new();
        input.push(seconds);
        self.named(CallID::Sleep, &input, |reply| result::<u32>(reply, |_| false))
    }

    pub fn sendmsg(&self, fd: i32, address: Option<&BridgeSockAddr>, data: &[u8], flags: i32)
                   -> i64 {
        let mut input = MessageWriter::new();
        input.push(fd);
        match address {
            Some(address) => input.push_bytes(&address.to_bytes()),
            None          => input.push_empty(),
        }
        input.push_bytes(data);
        input.push(flags);
        self.named(CallID::SendMsg, &input, |reply| result::<i64>(reply, |rc| rc < 0))
    }

    /// Receive up to `len` bytes into `message`
    pub fn recvmsg(&self, fd: i32, len: usize, flags: i32, message: &mut ReceivedMessage) -> i64 {
        let mut input = MessageWriter::new();
        input.push(fd);
        input.push(len as u64);
        input.push(flags);
        self.named(CallID::RecvMsg, &input, |reply| {
            let rc = result::<i64>(reply, |rc| rc < 0)?;
            if rc >= 0 {
                message.data    = reply.next_bytes()?;
                message.address = optional_address(reply.next_extent()?)?;
                message.flags   = reply.next::<i32>()?;
            }
            Ok(rc)
        })
    }

    fn address_call(&self, id: CallID, fd: i32, address: &mut Option<BridgeSockAddr>) -> i32 {
        let mut input = MessageWriter::new();
        input.push(fd);
        self.named(id, &input, |reply| {
            let rc = result::<i32>(reply, |rc| rc < 0)?;
            if rc >= 0 {
                *address = optional_address(reply.next_extent()?)?;
            }
            Ok(rc)
        })
    }

    pub fn getsockname(&self, fd: i32, address: &mut Option<BridgeSockAddr>) -> i32 {
        self.address_call(CallID::GetSockname, fd, address)
    }

    /// Returns the accepted descriptor; `address` receives the peer
    pub fn accept(&self, fd: i32, address: &mut Option<BridgeSockAddr>) -> i32 {
        self.address_call(CallID::Accept, fd, address)
    }

    pub fn getpeername(&self, fd: i32, address: &mut Option<BridgeSockAddr>) -> i32 {
        self.address_call(CallID::GetPeername, fd, address)
    }

    pub fn recvfrom(&self, fd: i32, buf: &mut [u8], flags: i32,
                    address: &mut Option<BridgeSockAddr>) -> i64 {
        let mut input = MessageWriter::new();
        input.push(fd);
        input.push(buf.len() as u64);
        input.push(flags);
        self.named(CallID::RecvFrom, &input, |reply| {
            let rc = result::<i64>(reply, |rc| rc < 0)?;
            if rc >= 0 {
                let data = reply.next_extent()?;
                let n = data.len().min(buf.len());
                buf[.. n].copy_from_slice(&data[.. n]);
                *address = optional_address(reply.next_extent()?)?;
            }
            Ok(rc)
        })
    }

    /// Raise a bridge signal in the host process
    pub fn raise(&self, signum: i32) -> i32 {
        let mut input = MessageWriter::new();
        input.push(signum);
        self.named(CallID::Raise, &input, |reply| result::<i32>(reply, |rc| rc != 0))
    }

    pub fn uname(&self, uts: &mut BridgeUtsName) -> i32 {
        self.named(CallID::Uname, &MessageWriter::new(), |reply| {
            let rc = result::<i32>(reply, |rc| rc != 0)?;
            if rc == 0 {
                *uts = BridgeUtsName::decode(reply)?;
            }
            Ok(rc)
        })
    }

    /// Password entry of a user, `None` with errno set if there is none
    pub fn getpwuid(&self, uid: u32) -> Option<BridgePassWd> {
        let mut input = MessageWriter::new();
        input.push(uid);
        self.named(CallID::GetPwUid, &input, |reply| {
            let rc = result::<i32>(reply, |rc| rc != 0)?;
            if rc != 0 {
                return Ok(None);
            }
            Ok(Some(BridgePassWd::decode(reply)?))
        })
    }

    /// `options` are bridge `W*` flags
    pub fn wait3(&self, status: &mut BridgeWStatus, options: i32, usage: &mut BridgeRUsage) -> i32 {
        let mut input = MessageWriter::new();
        input.push(options);
        self.named(CallID::Wait3, &input, |reply| {
            let rc = result::<i32>(reply, |rc| rc < 0)?;
            status.code = reply.next::<u8>()?;
            status.info = reply.next::<u8>()?;
            *usage = BridgeRUsage::decode(reply)?;
            Ok(rc)
        })
    }

    pub fn waitpid(&self, pid: i32, status: &mut BridgeWStatus, options: i32) -> i32 {
        let mut input = MessageWriter::new();
        input.push(pid);
        input.push(options);
        self.named(CallID::WaitPid, &input, |reply| {
            let rc = result::<i32>(reply, |rc| rc < 0)?;
            status.code = reply.next::<u8>()?;
            status.info = reply.next::<u8>()?;
            Ok(rc)
        })
    }

    /// Bridge options and facility
    pub fn openlog(&self, ident: &str, option: i32, facility: i32) {
        let mut input = MessageWriter::new();
        input.push_str(ident);
        input.push(option);
        input.push(facility);
        self.named(CallID::OpenLog, &input, |_| Ok(()))
    }

    /// Bridge priority
    pub fn syslog(&self, priority: i32, message: &str) {
        let mut input = MessageWriter::new();
        input.push(priority);
        input.push_str(message);
        self.named(CallID::SysLog, &input, |_| Ok(()))
    }

    /// Ask the host to relay a bridge signal to the enclave `enclave_name`
    pub fn register_signal_handler(&self, signum: i32, handler: &BridgeSignalHandler,
                                   enclave_name: &str) -> i32 {
        let mut input = MessageWriter::new();
        input.push(signum);
        handler.encode(&mut input);
        input.push_str(enclave_name);
        self.named(CallID::RegisterSignalHandler, &input,
                   |reply| result::<i32>(reply, |rc| rc != 0))
    }

    /// Fork the host process
    ///
    /// # Inputs
    /// * 'enclave_name' is the enclave to duplicate
    /// * 'restore_snapshot' carries the enclave memory over to the child
    ///
    /// # Returns
    ///
    /// The child's pid in the parent, 0 in the child and -1 on failure

    pub fn fork(&self, enclave_name: &str, restore_snapshot: bool) -> i32 {
        let mut input = MessageWriter::new();
        input.push_str(enclave_name);
        input.push(restore_snapshot);
        self.named(CallID::Fork, &input, |reply| result::<i32>(reply, |rc| rc < 0))
    }

    pub fn debug_puts(&self, text: &str) -> i32 {
        let mut input = MessageWriter::new();
        input.push_bytes(text.as_bytes());
        self.named(CallID::DebugPuts, &input, |reply| result::<i32>(reply, |rc| rc < 0))
    }
}

/* Result and bridge errno; errno is set when 'failed' holds */
fn result<T: Scalar>(reply: &mut MessageReader, failed: impl Fn(T) -> bool) -> Result<T, Error> {
    let rc = reply.next::<T>()?;
    let bridge_errno = reply.next::<i32>()?;
    if failed(rc) {
        set_errno(from_bridge_errno(bridge_errno));
    }
    Ok(rc)
}

fn optional_address(bytes: &[u8]) -> Result<Option<BridgeSockAddr>, Error> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(BridgeSockAddr::from_bytes(bytes)?))
}

fn copy_out(buf: &mut [u8], out: &[Vec<u8>], len: usize) {
    if let Some(data) = out.first() {
        let n = len.min(data.len()).min(buf.len());
        buf[.. n].copy_from_slice(&data[.. n]);
    }
}

fn c_path(path: &str) -> Option<Vec<u8>> {
    match CString::new(path) {
        Ok(path) => Some(path.into_bytes_with_nul()),
        Err(_)   => {
            set_errno(libc::EINVAL);
            None
        },
    }
}

fn host_address_bytes(addr: &BridgeSockAddr) -> Result<Vec<u8>, Error> {
    let (storage, len) = addr.to_host()?;
    let bytes = unsafe { as_bytes(&storage) };
    Ok(bytes[.. len as usize].to_vec())
}

/* Plain C structures only */
unsafe fn as_bytes<T>(value: &T) -> &[u8] {
    core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use edge::Status;
    use edge::bridge::fs::{BRIDGE_O_APPEND, BRIDGE_O_CREAT, BRIDGE_O_NONBLOCK, BRIDGE_O_RDONLY,
                           BRIDGE_O_WRONLY};
    use edge::bridge::sys::{to_bridge_errno, BRIDGE_ENOENT};
    use edge::ocall::{decode_syscall, SYSCALL_BASE};

    /* Replies like the host would, and records what it was sent */
    #[derive(Default)]
    struct FakeHost {
        calls: Mutex<Vec<(u64, Vec<SyscallArg>)>>,
    }

    impl HostExit for FakeHost {
        fn exit(&self, selector: u64, params: &mut BoundaryParams) -> Status {
            let mut input = params.take_input().unwrap();
            let mut output = MessageWriter::new();
            match Selector::from_u64(selector) {
                Selector::Syscall(sysno::READ) => {
                    let args = decode_syscall(&mut input).unwrap();
                    self.calls.lock().unwrap().push((sysno::READ, args));
                    output.push(5i64);
                    output.push(0i32);
                    output.push_bytes(b"hello");
                },
                Selector::Syscall(sysno::OPENAT) => {
                    let args = decode_syscall(&mut input).unwrap();
                    self.calls.lock().unwrap().push((sysno::OPENAT, args));
                    output.push(-1i64);
                    output.push(BRIDGE_ENOENT);
                },
                Selector::Syscall(sysno::FCNTL) => {
                    let args = decode_syscall(&mut input).unwrap();
                    self.calls.lock().unwrap().push((sysno::FCNTL, args));
                    /* O_LARGEFILE has no bridge value */
                    output.push((libc::O_WRONLY | libc::O_APPEND | 0o100000) as i64);
                    output.push(0i32);
                },
                Selector::Handler(id) if id == CallID::as_u64(CallID::IsAtty) => {
                    assert_eq!(input.next::<i32>().unwrap(), 0);
                    output.push(1i32);
                    output.push(0i32);
                },
                Selector::Handler(id) if id == CallID::as_u64(CallID::Fork) => {
                    assert_eq!(input.next_string().unwrap(), "app");
                    assert!(input.next::<bool>().unwrap());
                    output.push(-1i32);
                    output.push(to_bridge_errno(libc::EAGAIN));
                },
                _ => {
                    Error::BadSelector(selector).encode(&mut output);
                    params.set_output(&output).unwrap();
                    return Status::BadCallID;
                },
            }
            params.set_output(&output).unwrap();
            Status::Success
        }
    }

    fn calls() -> (Arc<FakeHost>, HostCalls) {
        let host = Arc::new(FakeHost::default());
        (host.clone(), HostCalls::new(host))
    }

    #[test]
    fn read_copies_the_output_buffer() {
        let (host, calls) = calls();
        let mut buf = [0u8; 16];
        assert_eq!(calls.read(3, &mut buf), 5);
        assert_eq!(&buf[.. 5], b"hello");

        let recorded = host.calls.lock().unwrap();
        assert_eq!(recorded[0].1, vec![SyscallArg::Scalar(3),
                                       SyscallArg::Out(16),
                                       SyscallArg::Scalar(16)]);
    }

    #[test]
    fn failures_set_errno() {
        let (host, calls) = calls();
        set_errno(0);
        assert_eq!(calls.open("/missing", BRIDGE_O_RDONLY, 0), -1);
        assert_eq!(errno(), libc::ENOENT);

        let recorded = host.calls.lock().unwrap();
        assert_eq!(recorded[0].1[1], SyscallArg::In(b"/missing\0".to_vec()));
    }

    #[test]
    fn file_flags_cross_in_bridge_values() {
        let (host, calls) = calls();
        calls.open("/new", BRIDGE_O_WRONLY | BRIDGE_O_CREAT, 0o644);
        assert_eq!(calls.fcntl(3, BRIDGE_F_GETFL, 0), BRIDGE_O_WRONLY | BRIDGE_O_APPEND);
        assert!(calls.fcntl(3, BRIDGE_F_SETFL, BRIDGE_O_NONBLOCK as i64) >= 0);

        let recorded = host.calls.lock().unwrap();
        assert_eq!(recorded[0].1[2], SyscallArg::Scalar((libc::O_WRONLY | libc::O_CREAT) as i64));
        assert_eq!(recorded[0].1[3], SyscallArg::Scalar(0o644));
        assert_eq!(recorded[1].1, vec![SyscallArg::Scalar(3),
                                       SyscallArg::Scalar(libc::F_GETFL as i64),
                                       SyscallArg::Scalar(0)]);
        assert_eq!(recorded[2].1[2], SyscallArg::Scalar(libc::O_NONBLOCK as i64));
    }

    #[test]
    fn unknown_fcntl_command_is_rejected_locally() {
        let (host, calls) = calls();
        assert_eq!(calls.fcntl(3, 0x7777, 0), -1);
        assert_eq!(errno(), libc::EINVAL);
        assert!(host.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn interior_nul_is_rejected_locally() {
        let (host, calls) = calls();
        assert_eq!(calls.open("a\0b", BRIDGE_O_RDONLY, 0), -1);
        assert_eq!(errno(), libc::EINVAL);
        assert!(host.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn named_calls_decode_their_replies() {
        let (_host, calls) = calls();
        assert_eq!(calls.isatty(0), 1);
        assert_eq!(calls.fork("app", true), -1);
        assert_eq!(errno(), libc::EAGAIN);
    }

    #[test]
    fn raw_call_reports_host_errors() {
        let (_host, calls) = calls();
        let result = calls.call(SYSCALL_BASE - 1, &MessageWriter::new());
        assert!(matches!(result, Err(Error::BadSelector(_))));
    }

    #[test]
    fn unknown_family_is_rejected_locally() {
        let (_host, calls) = calls();
        assert_eq!(calls.socket(0x7777, 1, 0), -1);
        assert_eq!(errno(), libc::EAFNOSUPPORT);
    }
}
