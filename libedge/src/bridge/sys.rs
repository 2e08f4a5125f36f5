//! System identification, password entries, sysconf names and errno values
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use core::ffi::CStr;

use super::{Table, const_from_bridge, const_to_bridge};
use crate::Error;
use crate::message::{MessageReader, MessageWriter};

/// Length of every `utsname` field, including the terminator
pub const BRIDGE_UTSNAME_LENGTH: usize = 65;

/// Bridge form of `struct utsname`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeUtsName {
    pub sysname:    String,
    pub nodename:   String,
    pub release:    String,
    pub version:    String,
    pub machine:    String,
    pub domainname: String,
}

impl BridgeUtsName {

    /// Read a host `utsname`. Fields are truncated to the bridge length.
    pub fn from_host(uts: &libc::utsname) -> Self {
        Self{sysname:    field(&uts.sysname),
             nodename:   field(&uts.nodename),
             release:    field(&uts.release),
             version:    field(&uts.version),
             machine:    field(&uts.machine),
             domainname: field(&uts.domainname)}
    }

    pub fn encode(&self, writer: &mut MessageWriter) {
        for value in [&self.sysname, &self.nodename, &self.release,
                      &self.version, &self.machine, &self.domainname] {
            writer.push_str(value);
        }
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        Ok(Self{sysname:    reader.next_string()?,
                nodename:   reader.next_string()?,
                release:    reader.next_string()?,
                version:    reader.next_string()?,
                machine:    reader.next_string()?,
                domainname: reader.next_string()?})
    }
}

fn field(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw.iter()
                            .take(BRIDGE_UTSNAME_LENGTH - 1)
                            .take_while(|c| **c != 0)
                            .map(|c| *c as u8)
                            .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Longest string field accepted in a password entry
pub const BRIDGE_PASSWD_FIELD_MAX: usize = 1024;

/// Bridge form of `struct passwd`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgePassWd {
    pub pw_name:   String,
    pub pw_passwd: String,
    pub pw_uid:    u32,
    pub pw_gid:    u32,
    pub pw_gecos:  String,
    pub pw_dir:    String,
    pub pw_shell:  String,
}

impl BridgePassWd {

    /// Copy a host password entry
    ///
    /// # Safety
    ///
    /// The string pointers in `pw` must be null or point to NUL-terminated
    /// strings, as returned by `getpwuid`.
    ///
    /// # Returns
    ///
    /// The entry, or Err(Error::InvalidArgument) if a field is too long

    pub unsafe fn from_host(pw: &libc::passwd) -> Result<Self, Error> {
        Ok(Self{pw_name:   c_field(pw.pw_name)?,
                pw_passwd: c_field(pw.pw_passwd)?,
                pw_uid:    pw.pw_uid as u32,
                pw_gid:    pw.pw_gid as u32,
                pw_gecos:  c_field(pw.pw_gecos)?,
                pw_dir:    c_field(pw.pw_dir)?,
                pw_shell:  c_field(pw.pw_shell)?})
    }

    pub fn encode(&self, writer: &mut MessageWriter) {
        writer.push_str(&self.pw_name);
        writer.push_str(&self.pw_passwd);
        writer.push(self.pw_uid);
        writer.push(self.pw_gid);
        writer.push_str(&self.pw_gecos);
        writer.push_str(&self.pw_dir);
        writer.push_str(&self.pw_shell);
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        Ok(Self{pw_name:   reader.next_string()?,
                pw_passwd: reader.next_string()?,
                pw_uid:    reader.next()?,
                pw_gid:    reader.next()?,
                pw_gecos:  reader.next_string()?,
                pw_dir:    reader.next_string()?,
                pw_shell:  reader.next_string()?})
    }
}

unsafe fn c_field(ptr: *const libc::c_char) -> Result<String, Error> {
    if ptr.is_null() {
        return Ok(String::new());
    }

    let bytes = CStr::from_ptr(ptr).to_bytes();
    if bytes.len() >= BRIDGE_PASSWD_FIELD_MAX {
        return Err(Error::InvalidArgument("password entry field too long".into()));
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

pub const BRIDGE_SC_NPROCESSORS_CONF: i32 = 1;
pub const BRIDGE_SC_NPROCESSORS_ONLN: i32 = 2;
pub const BRIDGE_SC_PAGESIZE:         i32 = 3;
pub const BRIDGE_SC_CLK_TCK:          i32 = 4;
pub const BRIDGE_SC_OPEN_MAX:         i32 = 5;

pub(crate) const SYSCONF_TABLE: &Table = &[
    (BRIDGE_SC_NPROCESSORS_CONF as i64, libc::_SC_NPROCESSORS_CONF as i64),
    (BRIDGE_SC_NPROCESSORS_ONLN as i64, libc::_SC_NPROCESSORS_ONLN as i64),
    (BRIDGE_SC_PAGESIZE as i64,         libc::_SC_PAGESIZE as i64),
    (BRIDGE_SC_CLK_TCK as i64,          libc::_SC_CLK_TCK as i64),
    (BRIDGE_SC_OPEN_MAX as i64,         libc::_SC_OPEN_MAX as i64),
];

/// Translate a host sysconf name, -1 when unsupported
pub fn to_bridge_sysconf_name(host: i32) -> i32 {
    const_to_bridge(host as i64, SYSCONF_TABLE, -1) as i32
}

pub fn from_bridge_sysconf_name(bridge: i32) -> i32 {
    const_from_bridge(bridge as i64, SYSCONF_TABLE, -1) as i32
}

pub const BRIDGE_EPERM:        i32 = 1;
pub const BRIDGE_ENOENT:       i32 = 2;
pub const BRIDGE_ESRCH:        i32 = 3;
pub const BRIDGE_EINTR:        i32 = 4;
pub const BRIDGE_EIO:          i32 = 5;
pub const BRIDGE_E2BIG:        i32 = 6;
pub const BRIDGE_EBADF:        i32 = 7;
pub const BRIDGE_ECHILD:       i32 = 8;
pub const BRIDGE_EAGAIN:       i32 = 9;
pub const BRIDGE_ENOMEM:       i32 = 10;
pub const BRIDGE_EACCES:       i32 = 11;
pub const BRIDGE_EFAULT:       i32 = 12;
pub const BRIDGE_EBUSY:        i32 = 13;
pub const BRIDGE_EEXIST:       i32 = 14;
pub const BRIDGE_EXDEV:        i32 = 15;
pub const BRIDGE_ENOTDIR:      i32 = 16;
pub const BRIDGE_EISDIR:       i32 = 17;
pub const BRIDGE_EINVAL:       i32 = 18;
pub const BRIDGE_ENFILE:       i32 = 19;
pub const BRIDGE_EMFILE:       i32 = 20;
pub const BRIDGE_ENOTTY:       i32 = 21;
pub const BRIDGE_EFBIG:        i32 = 22;
pub const BRIDGE_ENOSPC:       i32 = 23;
pub const BRIDGE_ESPIPE:       i32 = 24;
pub const BRIDGE_EROFS:        i32 = 25;
pub const BRIDGE_EPIPE:        i32 = 26;
pub const BRIDGE_ERANGE:       i32 = 27;
pub const BRIDGE_ENOSYS:       i32 = 28;
pub const BRIDGE_ENOTEMPTY:    i32 = 29;
pub const BRIDGE_ENAMETOOLONG: i32 = 30;
pub const BRIDGE_ENOTSOCK:     i32 = 31;
pub const BRIDGE_EAFNOSUPPORT: i32 = 32;
pub const BRIDGE_EADDRINUSE:   i32 = 33;
pub const BRIDGE_ECONNRESET:   i32 = 34;
pub const BRIDGE_ENOTCONN:     i32 = 35;
pub const BRIDGE_ETIMEDOUT:    i32 = 36;
pub const BRIDGE_ECONNREFUSED: i32 = 37;
pub const BRIDGE_EINPROGRESS:  i32 = 38;
pub const BRIDGE_EOPNOTSUPP:   i32 = 39;

pub(crate) const ERRNO_TABLE: &Table = &[
    (BRIDGE_EPERM as i64,        libc::EPERM as i64),
    (BRIDGE_ENOENT as i64,       libc::ENOENT as i64),
    (BRIDGE_ESRCH as i64,        libc::ESRCH as i64),
    (BRIDGE_EINTR as i64,        libc::EINTR as i64),
    (BRIDGE_EIO as i64,          libc::EIO as i64),
    (BRIDGE_E2BIG as i64,        libc::E2BIG as i64),
    (BRIDGE_EBADF as i64,        libc::EBADF as i64),
    (BRIDGE_ECHILD as i64,       libc::ECHILD as i64),
    (BRIDGE_EAGAIN as i64,       libc::EAGAIN as i64),
    (BRIDGE_ENOMEM as i64,       libc::ENOMEM as i64),
    (BRIDGE_EACCES as i64,       libc::EACCES as i64),
    (BRIDGE_EFAULT as i64,       libc::EFAULT as i64),
    (BRIDGE_EBUSY as i64,        libc::EBUSY as i64),
    (BRIDGE_EEXIST as i64,       libc::EEXIST as i64),
    (BRIDGE_EXDEV as i64,        libc::EXDEV as i64),
    (BRIDGE_ENOTDIR as i64,      libc::ENOTDIR as i64),
    (BRIDGE_EISDIR as i64,       libc::EISDIR as i64),
    (BRIDGE_EINVAL as i64,       libc::EINVAL as i64),
    (BRIDGE_ENFILE as i64,       libc::ENFILE as i64),
    (BRIDGE_EMFILE as i64,       libc::EMFILE as i64),
    (BRIDGE_ENOTTY as i64,       libc::ENOTTY as i64),
    (BRIDGE_EFBIG as i64,        libc::EFBIG as i64),
    (BRIDGE_ENOSPC as i64,       libc::ENOSPC as i64),
    (BRIDGE_ESPIPE as i64,       libc::ESPIPE as i64),
    (BRIDGE_EROFS as i64,        libc::EROFS as i64),
    (BRIDGE_EPIPE as i64,        libc::EPIPE as i64),
    (BRIDGE_ERANGE as i64,       libc::ERANGE as i64),
    (BRIDGE_ENOSYS as i64,       libc::ENOSYS as i64),
    (BRIDGE_ENOTEMPTY as i64,    libc::ENOTEMPTY as i64),
    (BRIDGE_ENAMETOOLONG as i64, libc::ENAMETOOLONG as i64),
    (BRIDGE_ENOTSOCK as i64,     libc::ENOTSOCK as i64),
    (BRIDGE_EAFNOSUPPORT as i64, libc::EAFNOSUPPORT as i64),
    (BRIDGE_EADDRINUSE as i64,   libc::EADDRINUSE as i64),
    (BRIDGE_ECONNRESET as i64,   libc::ECONNRESET as i64),
    (BRIDGE_ENOTCONN as i64,     libc::ENOTCONN as i64),
    (BRIDGE_ETIMEDOUT as i64,    libc::ETIMEDOUT as i64),
    (BRIDGE_ECONNREFUSED as i64, libc::ECONNREFUSED as i64),
    (BRIDGE_EINPROGRESS as i64,  libc::EINPROGRESS as i64),
    (BRIDGE_EOPNOTSUPP as i64,   libc::EOPNOTSUPP as i64),
];

/// Translate a host errno; zero stays zero, unknown values become EINVAL
pub fn to_bridge_errno(host: i32) -> i32 {
    if host == 0 {
        return 0;
    }
    const_to_bridge(host as i64, ERRNO_TABLE, BRIDGE_EINVAL as i64) as i32
}

pub fn from_bridge_errno(bridge: i32) -> i32 {
    if bridge == 0 {
        return 0;
    }
    const_from_bridge(bridge as i64, ERRNO_TABLE, libc::EINVAL as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fuzz;

    #[test]
    fn sysconf_names_round_trip() {
        fuzz::constant_round_trip(SYSCONF_TABLE, -1,
                                  |h| to_bridge_sysconf_name(h as i32) as i64,
                                  |b| from_bridge_sysconf_name(b as i32) as i64);
    }

    #[test]
    fn errno_values_round_trip() {
        let _ = env_logger::builder().is_test(true).try_init();
        for (bridge, host) in ERRNO_TABLE {
            assert_eq!(from_bridge_errno(to_bridge_errno(*host as i32)), *host as i32);
            assert_eq!(to_bridge_errno(from_bridge_errno(*bridge as i32)), *bridge as i32);
        }
        assert_eq!(to_bridge_errno(0), 0);
        assert_eq!(to_bridge_errno(9999), BRIDGE_EINVAL);
    }

    #[test]
    fn uname_of_this_host() {
        let mut uts: libc::utsname = unsafe { core::mem::zeroed() };
        assert_eq!(unsafe { libc::uname(&mut uts) }, 0);
        let bridge = BridgeUtsName::from_host(&uts);
        assert_eq!(bridge.sysname, "Linux");

        let mut writer = MessageWriter::new();
        bridge.encode(&mut writer);
        let mut reader = MessageReader::from(writer);
        assert_eq!(BridgeUtsName::decode(&mut reader).unwrap(), bridge);
    }

    #[test]
    fn passwd_of_current_user() {
        let pw = unsafe { libc::getpwuid(libc::getuid()) };
        if pw.is_null() {
            return;
        }
        let entry = unsafe { BridgePassWd::from_host(&*pw) }.unwrap();
        assert_eq!(entry.pw_uid, unsafe { libc::getuid() });
    }
}
