//! File status flags, fcntl commands, file modes, stat and statfs
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use super::{Table, bits_from_bridge, bits_to_bridge, const_from_bridge, const_to_bridge};
use crate::Error;
use crate::message::{MessageReader, MessageWriter};

pub const BRIDGE_O_RDONLY:    i32 = 0x0;
pub const BRIDGE_O_WRONLY:    i32 = 0x1;
pub const BRIDGE_O_RDWR:      i32 = 0x2;
pub const BRIDGE_O_CREAT:     i32 = 0x4;
pub const BRIDGE_O_EXCL:      i32 = 0x8;
pub const BRIDGE_O_NOCTTY:    i32 = 0x10;
pub const BRIDGE_O_TRUNC:     i32 = 0x20;
pub const BRIDGE_O_APPEND:    i32 = 0x40;
pub const BRIDGE_O_NONBLOCK:  i32 = 0x80;
pub const BRIDGE_O_DSYNC:     i32 = 0x100;
/// Synchronous writes imply synchronous data on both sides
pub const BRIDGE_O_SYNC:      i32 = 0x200 | BRIDGE_O_DSYNC;
pub const BRIDGE_O_DIRECTORY: i32 = 0x400;
pub const BRIDGE_O_NOFOLLOW:  i32 = 0x800;
pub const BRIDGE_O_CLOEXEC:   i32 = 0x1000;

const BRIDGE_O_ACCMODE: i32 = 0x3;

pub(crate) const ACCESS_MODE_TABLE: &Table = &[
    (BRIDGE_O_RDONLY as i64, libc::O_RDONLY as i64),
    (BRIDGE_O_WRONLY as i64, libc::O_WRONLY as i64),
    (BRIDGE_O_RDWR as i64,   libc::O_RDWR as i64),
];

pub(crate) const FILE_STATUS_TABLE: &Table = &[
    (BRIDGE_O_CREAT as i64,     libc::O_CREAT as i64),
    (BRIDGE_O_EXCL as i64,      libc::O_EXCL as i64),
    (BRIDGE_O_NOCTTY as i64,    libc::O_NOCTTY as i64),
    (BRIDGE_O_TRUNC as i64,     libc::O_TRUNC as i64),
    (BRIDGE_O_APPEND as i64,    libc::O_APPEND as i64),
    (BRIDGE_O_NONBLOCK as i64,  libc::O_NONBLOCK as i64),
    (BRIDGE_O_DSYNC as i64,     libc::O_DSYNC as i64),
    (BRIDGE_O_SYNC as i64,      libc::O_SYNC as i64),
    (BRIDGE_O_DIRECTORY as i64, libc::O_DIRECTORY as i64),
    (BRIDGE_O_NOFOLLOW as i64,  libc::O_NOFOLLOW as i64),
    (BRIDGE_O_CLOEXEC as i64,   libc::O_CLOEXEC as i64),
];

/// Translate host open flags: access mode plus status bits
pub fn to_bridge_file_status_flags(host: i32) -> i32 {
    let mode = const_to_bridge((host & libc::O_ACCMODE) as i64,
                               ACCESS_MODE_TABLE, BRIDGE_O_RDONLY as i64) as i32;
    mode | bits_to_bridge((host & !libc::O_ACCMODE) as i64, FILE_STATUS_TABLE) as i32
}

pub fn from_bridge_file_status_flags(bridge: i32) -> i32 {
    let mode = const_from_bridge((bridge & BRIDGE_O_ACCMODE) as i64,
                                 ACCESS_MODE_TABLE, libc::O_RDONLY as i64) as i32;
    mode | bits_from_bridge((bridge & !BRIDGE_O_ACCMODE) as i64, FILE_STATUS_TABLE) as i32
}

pub const BRIDGE_FD_CLOEXEC: i32 = 0x1;

pub(crate) const FD_FLAG_TABLE: &Table = &[
    (BRIDGE_FD_CLOEXEC as i64, libc::FD_CLOEXEC as i64),
];

pub fn to_bridge_fd_flags(host: i32) -> i32 {
    bits_to_bridge(host as i64, FD_FLAG_TABLE) as i32
}

pub fn from_bridge_fd_flags(bridge: i32) -> i32 {
    bits_from_bridge(bridge as i64, FD_FLAG_TABLE) as i32
}

pub const BRIDGE_F_GETFD:       i32 = 1;
pub const BRIDGE_F_SETFD:       i32 = 2;
pub const BRIDGE_F_GETFL:       i32 = 3;
pub const BRIDGE_F_SETFL:       i32 = 4;
pub const BRIDGE_F_GETPIPE_SZ:  i32 = 5;
pub const BRIDGE_F_SETPIPE_SZ:  i32 = 6;
pub const BRIDGE_F_DUPFD:       i32 = 7;
pub const BRIDGE_F_DUPFD_CLOEXEC: i32 = 8;

pub(crate) const FCNTL_CMD_TABLE: &Table = &[
    (BRIDGE_F_GETFD as i64,       libc::F_GETFD as i64),
    (BRIDGE_F_SETFD as i64,       libc::F_SETFD as i64),
    (BRIDGE_F_GETFL as i64,       libc::F_GETFL as i64),
    (BRIDGE_F_SETFL as i64,       libc::F_SETFL as i64),
    (BRIDGE_F_GETPIPE_SZ as i64,  libc::F_GETPIPE_SZ as i64),
    (BRIDGE_F_SETPIPE_SZ as i64,  libc::F_SETPIPE_SZ as i64),
    (BRIDGE_F_DUPFD as i64,       libc::F_DUPFD as i64),
    (BRIDGE_F_DUPFD_CLOEXEC as i64, libc::F_DUPFD_CLOEXEC as i64),
];

/// Translate a host fcntl command, -1 when unsupported
pub fn to_bridge_fcntl_cmd(host: i32) -> i32 {
    const_to_bridge(host as i64, FCNTL_CMD_TABLE, -1) as i32
}

pub fn from_bridge_fcntl_cmd(bridge: i32) -> i32 {
    const_from_bridge(bridge as i64, FCNTL_CMD_TABLE, -1) as i32
}

pub const BRIDGE_S_IFMT:   u32 = 0o170000;
pub const BRIDGE_S_IFSOCK: u32 = 0o140000;
pub const BRIDGE_S_IFLNK:  u32 = 0o120000;
pub const BRIDGE_S_IFREG:  u32 = 0o100000;
pub const BRIDGE_S_IFBLK:  u32 = 0o060000;
pub const BRIDGE_S_IFDIR:  u32 = 0o040000;
pub const BRIDGE_S_IFCHR:  u32 = 0o020000;
pub const BRIDGE_S_IFIFO:  u32 = 0o010000;

pub(crate) const FILE_TYPE_TABLE: &Table = &[
    (BRIDGE_S_IFSOCK as i64, libc::S_IFSOCK as i64),
    (BRIDGE_S_IFLNK as i64,  libc::S_IFLNK as i64),
    (BRIDGE_S_IFREG as i64,  libc::S_IFREG as i64),
    (BRIDGE_S_IFBLK as i64,  libc::S_IFBLK as i64),
    (BRIDGE_S_IFDIR as i64,  libc::S_IFDIR as i64),
    (BRIDGE_S_IFCHR as i64,  libc::S_IFCHR as i64),
    (BRIDGE_S_IFIFO as i64,  libc::S_IFIFO as i64),
];

/// Translate a host `st_mode`. Permission bits are the POSIX octal values
/// on both sides; the file type is looked up.
pub fn to_bridge_file_mode(host: u32) -> u32 {
    let kind = const_to_bridge((host & libc::S_IFMT as u32) as i64, FILE_TYPE_TABLE, 0) as u32;
    kind | (host & 0o7777)
}

pub fn from_bridge_file_mode(bridge: u32) -> u32 {
    let kind = const_from_bridge((bridge & BRIDGE_S_IFMT) as i64, FILE_TYPE_TABLE, 0) as u32;
    kind | (bridge & 0o7777)
}

/// Bridge form of `struct stat`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BridgeStat {
    pub st_dev:     u64,
    pub st_ino:     u64,
    pub st_mode:    u32,
    pub st_nlink:   u64,
    pub st_uid:     u32,
    pub st_gid:     u32,
    pub st_rdev:    u64,
    pub st_size:    i64,
    pub st_blksize: i64,
    pub st_blocks:  i64,
    pub st_atime:   i64,
    pub st_mtime:   i64,
    pub st_ctime:   i64,
}

impl BridgeStat {
    pub fn from_host(st: &libc::stat) -> Self {
        Self{st_dev:     st.st_dev as u64,
             st_ino:     st.st_ino as u64,
             st_mode:    to_bridge_file_mode(st.st_mode as u32),
             st_nlink:   st.st_nlink as u64,
             st_uid:     st.st_uid as u32,
             st_gid:     st.st_gid as u32,
             st_rdev:    st.st_rdev as u64,
             st_size:    st.st_size as i64,
             st_blksize: st.st_blksize as i64,
             st_blocks:  st.st_blocks as i64,
             st_atime:   st.st_atime as i64,
             st_mtime:   st.st_mtime as i64,
             st_ctime:   st.st_ctime as i64}
    }

    /// Read a host `struct stat` returned in raw bytes
    pub fn from_host_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != core::mem::size_of::<libc::stat>() {
            return Err(Error::Malformed("stat buffer has the wrong size".into()));
        }
        let st = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const libc::stat) };
        Ok(Self::from_host(&st))
    }

    pub fn is_dir(&self) -> bool {
        self.st_mode & BRIDGE_S_IFMT == BRIDGE_S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.st_mode & BRIDGE_S_IFMT == BRIDGE_S_IFREG
    }
}

pub const BRIDGE_ST_RDONLY:      i64 = 0x01;
pub const BRIDGE_ST_NOSUID:      i64 = 0x02;
pub const BRIDGE_ST_NODEV:       i64 = 0x04;
pub const BRIDGE_ST_NOEXEC:      i64 = 0x08;
pub const BRIDGE_ST_SYNCHRONOUS: i64 = 0x10;
pub const BRIDGE_ST_NOATIME:     i64 = 0x20;
pub const BRIDGE_ST_NODIRATIME:  i64 = 0x40;
pub const BRIDGE_ST_RELATIME:    i64 = 0x80;

pub(crate) const STATFS_FLAG_TABLE: &Table = &[
    (BRIDGE_ST_RDONLY,      libc::ST_RDONLY as i64),
    (BRIDGE_ST_NOSUID,      libc::ST_NOSUID as i64),
    (BRIDGE_ST_NODEV,       libc::ST_NODEV as i64),
    (BRIDGE_ST_NOEXEC,      libc::ST_NOEXEC as i64),
    (BRIDGE_ST_SYNCHRONOUS, libc::ST_SYNCHRONOUS as i64),
    (BRIDGE_ST_NOATIME,     libc::ST_NOATIME as i64),
    (BRIDGE_ST_NODIRATIME,  libc::ST_NODIRATIME as i64),
    (BRIDGE_ST_RELATIME,    libc::ST_RELATIME as i64),
];

pub fn to_bridge_statfs_flags(host: i64) -> i64 {
    bits_to_bridge(host, STATFS_FLAG_TABLE)
}

pub fn from_bridge_statfs_flags(bridge: i64) -> i64 {
    bits_from_bridge(bridge, STATFS_FLAG_TABLE)
}

/// Bridge form of `struct statfs`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BridgeStatFs {
    pub f_type:    i64,
    pub f_bsize:   i64,
    pub f_blocks:  u64,
    pub f_bfree:   u64,
    pub f_bavail:  u64,
    pub f_files:   u64,
    pub f_ffree:   u64,
    pub f_namelen: i64,
    pub f_frsize:  i64,
    pub f_flags:   i64,
}

impl BridgeStatFs {
    pub fn from_host(st: &libc::statfs) -> Self {
        Self{f_type:    st.f_type as i64,
             f_bsize:   st.f_bsize as i64,
             f_blocks:  st.f_blocks as u64,
             f_bfree:   st.f_bfree as u64,
             f_bavail:  st.f_bavail as u64,
             f_files:   st.f_files as u64,
             f_ffree:   st.f_ffree as u64,
             f_namelen: st.f_namelen as i64,
             f_frsize:  st.f_frsize as i64,
             f_flags:   to_bridge_statfs_flags(st.f_flags as i64)}
    }

    /// Read a host `struct statfs` returned in raw bytes
    pub fn from_host_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != core::mem::size_of::<libc::statfs>() {
            return Err(Error::Malformed("statfs buffer has the wrong size".into()));
        }
        let st = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const libc::statfs) };
        Ok(Self::from_host(&st))
    }

    pub fn encode(&self, writer: &mut MessageWriter) {
        writer.push(self.f_type);
        writer.push(self.f_bsize);
        writer.push(self.f_blocks);
        writer.push(self.f_bfree);
        writer.push(self.f_bavail);
        writer.push(self.f_files);
        writer.push(self.f_ffree);
        writer.push(self.f_namelen);
        writer.push(self.f_frsize);
        writer.push(self.f_flags);
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        Ok(Self{f_type:    reader.next()?,
                f_bsize:   reader.next()?,
                f_blocks:  reader.next()?,
                f_bfree:   reader.next()?,
                f_bavail:  reader.next()?,
                f_files:   reader.next()?,
                f_ffree:   reader.next()?,
                f_namelen: reader.next()?,
                f_frsize:  reader.next()?,
                f_flags:   reader.next()?})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fuzz;

    #[test]
    fn file_status_flags_round_trip() {
        fuzz::bitset_round_trip(FILE_STATUS_TABLE,
                                |h| to_bridge_file_status_flags(h as i32) as i64,
                                |b| from_bridge_file_status_flags(b as i32) as i64);
    }

    #[test]
    fn access_mode_is_kept_with_flags() {
        let host = libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC;
        let bridge = to_bridge_file_status_flags(host);
        assert_eq!(bridge, BRIDGE_O_RDWR | BRIDGE_O_CREAT | BRIDGE_O_TRUNC);
        assert_eq!(from_bridge_file_status_flags(bridge), host);
    }

    #[test]
    fn sync_implies_dsync() {
        assert_eq!(to_bridge_file_status_flags(libc::O_SYNC), BRIDGE_O_SYNC);
        assert_eq!(from_bridge_file_status_flags(BRIDGE_O_DSYNC), libc::O_DSYNC);
    }

    #[test]
    fn fcntl_commands_round_trip() {
        fuzz::constant_round_trip(FCNTL_CMD_TABLE, -1,
                                  |h| to_bridge_fcntl_cmd(h as i32) as i64,
                                  |b| from_bridge_fcntl_cmd(b as i32) as i64);
    }

    #[test]
    fn fd_flags_round_trip() {
        fuzz::bitset_round_trip(FD_FLAG_TABLE,
                                |h| to_bridge_fd_flags(h as i32) as i64,
                                |b| from_bridge_fd_flags(b as i32) as i64);
    }

    #[test]
    fn statfs_flags_round_trip() {
        fuzz::bitset_round_trip(STATFS_FLAG_TABLE, to_bridge_statfs_flags,
                                from_bridge_statfs_flags);
    }

    #[test]
    fn file_mode_keeps_permissions() {
        let host = libc::S_IFDIR as u32 | 0o755;
        let bridge = to_bridge_file_mode(host);
        assert_eq!(bridge, BRIDGE_S_IFDIR | 0o755);
        assert_eq!(from_bridge_file_mode(bridge), host);
    }

    #[test]
    fn stat_of_a_directory() {
        let mut st: libc::stat = unsafe { core::mem::zeroed() };
        let path = b"/\0";
        assert_eq!(unsafe { libc::stat(path.as_ptr() as *const libc::c_char, &mut st) }, 0);
        assert!(BridgeStat::from_host(&st).is_dir());
    }
}
