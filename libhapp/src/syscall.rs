//! Generic system call handler
//!
//! The enclave sends a bridge system call number and tagged arguments. The
//! handler maps the number to the host's own, places buffer arguments in
//! host memory, runs the call and replies with the result, the bridge errno
//! and the contents of every output buffer in argument order.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use edge::bridge::sys::to_bridge_errno;
use edge::message::{MessageReader, MessageWriter};
use edge::ocall::{decode_syscall, sysno, SyscallArg, SYSCALL_MAX_ARGS};
use libc::c_long;
use log::warn;
use nix::errno::errno;

use crate::Error;

/// Largest output buffer a call may request
pub const SYSCALL_MAX_BUFFER: usize = 64 * 1024 * 1024;

/// Host number of a bridge system call, None if the host does not serve it
pub fn host_sysno(bridge: u64) -> Option<c_long> {
    let host = match bridge {
        sysno::READ              => libc::SYS_read,
        sysno::WRITE             => libc::SYS_write,
        sysno::CLOSE             => libc::SYS_close,
        sysno::FSTAT             => libc::SYS_fstat,
        sysno::LSEEK             => libc::SYS_lseek,
        sysno::PREAD64           => libc::SYS_pread64,
        sysno::PWRITE64          => libc::SYS_pwrite64,
        sysno::SCHED_YIELD       => libc::SYS_sched_yield,
        sysno::DUP               => libc::SYS_dup,
        sysno::NANOSLEEP         => libc::SYS_nanosleep,
        sysno::GETPID            => libc::SYS_getpid,
        sysno::SOCKET            => libc::SYS_socket,
        sysno::CONNECT           => libc::SYS_connect,
        sysno::SENDTO            => libc::SYS_sendto,
        sysno::SHUTDOWN          => libc::SYS_shutdown,
        sysno::BIND              => libc::SYS_bind,
        sysno::LISTEN            => libc::SYS_listen,
        sysno::SETSOCKOPT        => libc::SYS_setsockopt,
        sysno::KILL              => libc::SYS_kill,
        sysno::FCNTL             => libc::SYS_fcntl,
        sysno::FLOCK             => libc::SYS_flock,
        sysno::FSYNC             => libc::SYS_fsync,
        sysno::TRUNCATE          => libc::SYS_truncate,
        sysno::FTRUNCATE         => libc::SYS_ftruncate,
        sysno::FCHMOD            => libc::SYS_fchmod,
        sysno::FCHOWN            => libc::SYS_fchown,
        sysno::UMASK             => libc::SYS_umask,
        sysno::GETUID            => libc::SYS_getuid,
        sysno::GETGID            => libc::SYS_getgid,
        sysno::GETEUID           => libc::SYS_geteuid,
        sysno::GETEGID           => libc::SYS_getegid,
        sysno::GETPPID           => libc::SYS_getppid,
        sysno::SETSID            => libc::SYS_setsid,
        sysno::STATFS            => libc::SYS_statfs,
        sysno::FSTATFS           => libc::SYS_fstatfs,
        sysno::SCHED_GETAFFINITY => libc::SYS_sched_getaffinity,
        sysno::CLOCK_GETTIME     => libc::SYS_clock_gettime,
        sysno::OPENAT            => libc::SYS_openat,
        sysno::MKDIRAT           => libc::SYS_mkdirat,
        sysno::UNLINKAT          => libc::SYS_unlinkat,
        sysno::RENAMEAT          => libc::SYS_renameat,
        sysno::INOTIFY_INIT1     => libc::SYS_inotify_init1,
        sysno::PIPE2             => libc::SYS_pipe2,
        _                        => return None,
    };
    Some(host)
}

/// Serve one generic system call
///
/// # Inputs
/// * 'bridge' is the bridge system call number
/// * 'input' holds the encoded arguments
/// * 'output' receives result, bridge errno and the output buffers
///
/// # Returns
///
/// Ok() when a reply was produced, including failed calls, or an error if
/// the arguments could not be decoded

pub fn on_syscall(bridge: u64,
                  input: &mut MessageReader,
                  output: &mut MessageWriter)
                  -> Result<(), Error> {

    let args = decode_syscall(input)?;
    let host = match host_sysno(bridge) {
        Some(host) => host,
        None => {
            warn!("system call {} is not served by the host", bridge);
            output.push(-1i64);
            output.push(to_bridge_errno(libc::ENOSYS));
            return Ok(());
        },
    };

    /* Buffers stay in place until the results are copied out */
    let mut buffers: Vec<Option<Vec<u8>>> = Vec::with_capacity(args.len());
    for arg in &args {
        buffers.push(match arg {
            SyscallArg::Scalar(_) => None,
            SyscallArg::In(bytes) | SyscallArg::InOut(bytes) => Some(bytes.clone()),
            SyscallArg::Out(len) => {
                if *len > SYSCALL_MAX_BUFFER {
                    return Err(Error::InvalidArgument(
                        format!("output buffer of {} bytes", len)));
                }
                Some(vec![0u8; *len])
            },
        });
    }

    let mut raw: [c_long; SYSCALL_MAX_ARGS] = [0; SYSCALL_MAX_ARGS];
    for (slot, (arg, buffer)) in raw.iter_mut().zip(args.iter().zip(buffers.iter_mut())) {
        *slot = match (arg, buffer) {
            (SyscallArg::Scalar(value), _) => *value as c_long,
            (_, Some(bytes)) => bytes.as_mut_ptr() as c_long,
            (_, None) => 0,
        };
    }

    let rc = unsafe { libc::syscall(host, raw[0], raw[1], raw[2], raw[3], raw[4], raw[5]) };
    let host_errno = if rc < 0 { errno() } else { 0 };

    output.push(rc as i64);
    output.push(to_bridge_errno(host_errno));
    for (arg, buffer) in args.iter().zip(buffers.iter()) {
        if let (true, Some(bytes)) = (arg.is_output(), buffer) {
            output.push_bytes(bytes);
        }
    }

    Ok(())
}
