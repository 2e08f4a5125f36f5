//! Selectors for calls from the enclave out to the host
//!
//! Two selector spaces share one `u64`: system calls are dispatched
//! generically and are encoded as `SYSCALL_BASE + sysno`, while calls that
//! need custom marshalling have small named identifiers.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use crate::{Error, Status};
use crate::alloc::BoundaryParams;
use crate::message::{MessageReader, MessageWriter};

/// Selector offset of the generic system call space
pub const SYSCALL_BASE: u64 = 0x1_0000;

/// First selector available for user-defined host calls
pub const OCALL_USER_BASE: u64 = 0x800;

/// Named host calls that are not plain system calls
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum CallID {
    IsAtty                = 1,
    USleep                = 2,
    SysConf               = 3,
    Realloc               = 4,
    Sleep                 = 5,
    SendMsg               = 6,
    RecvMsg               = 7,
    GetSockname           = 8,
    Accept                = 9,
    GetPeername           = 10,
    RecvFrom              = 11,
    Raise                 = 12,
    Uname                 = 13,
    GetPwUid              = 14,
    Wait3                 = 15,
    WaitPid               = 16,
    OpenLog               = 17,
    SysLog                = 18,
    RegisterSignalHandler = 19,
    Fork                  = 20,
    DebugPuts             = 21,
}

impl CallID {
    pub fn as_u64(value: CallID) -> u64 {
        return value as u64;
    }
}

/// A decoded boundary selector
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// Generic system call with a bridge syscall number
    Syscall(u64),
    /// Any other selector
    Handler(u64),
}

impl Selector {
    pub fn from_u64(value: u64) -> Selector {
        if value >= SYSCALL_BASE {
            Selector::Syscall(value - SYSCALL_BASE)
        } else {
            Selector::Handler(value)
        }
    }

    pub fn as_u64(&self) -> u64 {
        return match *self {
            Selector::Syscall(sysno) => SYSCALL_BASE + sysno,
            Selector::Handler(id)    => id,
        };
    }
}

impl From<CallID> for Selector {
    fn from(id: CallID) -> Self {
        Selector::Handler(CallID::as_u64(id))
    }
}

/// Untrusted side of the boundary, as seen from inside the enclave
pub trait HostExit: Send + Sync {

    /// Leave the enclave to run a host call
    ///
    /// The callee takes (and frees) `params.input` and allocates
    /// `params.output` for any results.

    fn exit(&self, selector: u64, params: &mut BoundaryParams) -> Status;
}

/// Bridge system call numbers
///
/// The host maps these to its native numbers before executing the call.
pub mod sysno {
    pub const READ:              u64 = 0;
    pub const WRITE:             u64 = 1;
    pub const CLOSE:             u64 = 3;
    pub const FSTAT:             u64 = 5;
    pub const LSEEK:             u64 = 8;
    pub const PREAD64:           u64 = 17;
    pub const PWRITE64:          u64 = 18;
    pub const SCHED_YIELD:       u64 = 24;
    pub const DUP:               u64 = 32;
    pub const NANOSLEEP:         u64 = 35;
    pub const GETPID:            u64 = 39;
    pub const SOCKET:            u64 = 41;
    pub const CONNECT:           u64 = 42;
    pub const SENDTO:            u64 = 44;
    pub const SHUTDOWN:          u64 = 48;
    pub const BIND:              u64 = 49;
    pub const LISTEN:            u64 = 50;
    pub const SETSOCKOPT:        u64 = 54;
    pub const KILL:              u64 = 62;
    pub const FCNTL:             u64 = 72;
    pub const FLOCK:             u64 = 73;
    pub const FSYNC:             u64 = 74;
    pub const TRUNCATE:          u64 = 76;
    pub const FTRUNCATE:         u64 = 77;
    pub const FCHMOD:            u64 = 91;
    pub const FCHOWN:            u64 = 93;
    pub const UMASK:             u64 = 95;
    pub const GETUID:            u64 = 102;
    pub const GETGID:            u64 = 104;
    pub const GETEUID:           u64 = 107;
    pub const GETEGID:           u64 = 108;
    pub const GETPPID:           u64 = 110;
    pub const SETSID:            u64 = 112;
    pub const STATFS:            u64 = 137;
    pub const FSTATFS:           u64 = 138;
    pub const SCHED_GETAFFINITY: u64 = 204;
    pub const CLOCK_GETTIME:     u64 = 228;
    pub const OPENAT:            u64 = 257;
    pub const MKDIRAT:           u64 = 258;
    pub const UNLINKAT:          u64 = 263;
    pub const RENAMEAT:          u64 = 264;
    pub const INOTIFY_INIT1:     u64 = 294;
    pub const PIPE2:             u64 = 293;
}

/// One argument of a generic system call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyscallArg {
    /// Passed by value
    Scalar(i64),
    /// Pointer to bytes the host only reads
    In(Vec<u8>),
    /// Pointer to a buffer of the given size the host fills in
    Out(usize),
    /// Pointer to bytes the host reads and updates
    InOut(Vec<u8>),
}

const TAG_SCALAR: u8 = 0;
const TAG_IN:     u8 = 1;
const TAG_OUT:    u8 = 2;
const TAG_INOUT:  u8 = 3;

/// Maximum number of arguments of a system call
pub const SYSCALL_MAX_ARGS: usize = 6;

impl SyscallArg {

    /// Whether the host returns the argument's buffer after the call
    pub fn is_output(&self) -> bool {
        matches!(self, SyscallArg::Out(_) | SyscallArg::InOut(_))
    }

    /// Append as two extents: tag and value
    pub fn encode(&self, writer: &mut MessageWriter) {
        match self {
            SyscallArg::Scalar(v) => { writer.push(TAG_SCALAR); writer.push(*v); }
            SyscallArg::In(b)     => { writer.push(TAG_IN); writer.push_bytes(b); }
            SyscallArg::Out(n)    => { writer.push(TAG_OUT); writer.push(*n as u64); }
            SyscallArg::InOut(b)  => { writer.push(TAG_INOUT); writer.push_bytes(b); }
        }
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        return match reader.next::<u8>()? {
            TAG_SCALAR => Ok(SyscallArg::Scalar(reader.next::<i64>()?)),
            TAG_IN     => Ok(SyscallArg::In(reader.next_bytes()?)),
            TAG_OUT    => Ok(SyscallArg::Out(reader.next::<u64>()? as usize)),
            TAG_INOUT  => Ok(SyscallArg::InOut(reader.next_bytes()?)),
            tag        => Err(Error::Malformed(format!("unknown argument tag {}", tag))),
        };
    }
}

/// Encode a generic system call request
pub fn encode_syscall(args: &[SyscallArg]) -> Result<MessageWriter, Error> {
    if args.len() > SYSCALL_MAX_ARGS {
        return Err(Error::InvalidArgument(format!("{} syscall arguments", args.len())));
    }

    let mut writer = MessageWriter::new();
    writer.push(args.len() as u32);
    for arg in args {
        arg.encode(&mut writer);
    }
    Ok(writer)
}

/// Decode a generic system call request
pub fn decode_syscall(reader: &mut MessageReader) -> Result<Vec<SyscallArg>, Error> {
    let count = reader.next::<u32>()? as usize;
    if count > SYSCALL_MAX_ARGS {
        return Err(Error::Malformed(format!("{} syscall arguments", count)));
    }

    (0 .. count).map(|_| SyscallArg::decode(reader)).collect()
}
