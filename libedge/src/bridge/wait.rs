//! Wait options, wait status and resource usage
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use super::{BridgeTimeval, Table, bits_from_bridge, bits_to_bridge};
use super::signal::{from_bridge_signal, to_bridge_signal};
use crate::Error;
use crate::message::{MessageReader, MessageWriter};

pub const BRIDGE_WNOHANG:    i32 = 0x1;
pub const BRIDGE_WUNTRACED:  i32 = 0x2;
pub const BRIDGE_WCONTINUED: i32 = 0x4;

pub(crate) const WAIT_OPTION_TABLE: &Table = &[
    (BRIDGE_WNOHANG as i64,    libc::WNOHANG as i64),
    (BRIDGE_WUNTRACED as i64,  libc::WUNTRACED as i64),
    (BRIDGE_WCONTINUED as i64, libc::WCONTINUED as i64),
];

pub fn to_bridge_wait_options(host: i32) -> i32 {
    bits_to_bridge(host as i64, WAIT_OPTION_TABLE) as i32
}

pub fn from_bridge_wait_options(bridge: i32) -> i32 {
    bits_from_bridge(bridge as i64, WAIT_OPTION_TABLE) as i32
}

/* Bits of BridgeWStatus::info */
pub const BRIDGE_WEXITED:    u8 = 0x01;
pub const BRIDGE_WSIGNALED:  u8 = 0x02;
pub const BRIDGE_WSTOPPED:   u8 = 0x04;
pub const BRIDGE_WCONTINUED_INFO: u8 = 0x08;
pub const BRIDGE_WCOREDUMP:  u8 = 0x10;

/// Bridge wait status: `code` holds the exit code or the bridge signal
/// number, `info` says which one
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BridgeWStatus {
    pub code: u8,
    pub info: u8,
}

impl BridgeWStatus {

    pub fn from_host(status: i32) -> Self {
        if libc::WIFEXITED(status) {
            return Self{code: libc::WEXITSTATUS(status) as u8, info: BRIDGE_WEXITED};
        }

        if libc::WIFSIGNALED(status) {
            let mut info = BRIDGE_WSIGNALED;
            if libc::WCOREDUMP(status) {
                info |= BRIDGE_WCOREDUMP;
            }
            return Self{code: to_bridge_signal(libc::WTERMSIG(status)) as u8, info: info};
        }

        if libc::WIFSTOPPED(status) {
            return Self{code: to_bridge_signal(libc::WSTOPSIG(status)) as u8,
                        info: BRIDGE_WSTOPPED};
        }

        if libc::WIFCONTINUED(status) {
            return Self{code: 0, info: BRIDGE_WCONTINUED_INFO};
        }

        Self::default()
    }

    /// Host encoded status word
    pub fn to_host(&self) -> i32 {
        if self.info & BRIDGE_WEXITED != 0 {
            return (self.code as i32) << 8;
        }

        if self.info & BRIDGE_WSIGNALED != 0 {
            let core = if self.info & BRIDGE_WCOREDUMP != 0 { 0x80 } else { 0 };
            return (from_bridge_signal(self.code as i32) & 0x7f) | core;
        }

        if self.info & BRIDGE_WSTOPPED != 0 {
            return (from_bridge_signal(self.code as i32) << 8) | 0x7f;
        }

        if self.info & BRIDGE_WCONTINUED_INFO != 0 {
            return 0xffff;
        }

        0
    }

    pub fn exited(&self) -> bool {
        self.info & BRIDGE_WEXITED != 0
    }

    pub fn signaled(&self) -> bool {
        self.info & BRIDGE_WSIGNALED != 0
    }
}

/// Bridge form of `struct rusage`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BridgeRUsage {
    pub ru_utime:  BridgeTimeval,
    pub ru_stime:  BridgeTimeval,
    pub ru_maxrss: i64,
    pub ru_minflt: i64,
    pub ru_majflt: i64,
    pub ru_nvcsw:  i64,
    pub ru_nivcsw: i64,
}

impl BridgeRUsage {
    pub fn from_host(usage: &libc::rusage) -> Self {
        Self{ru_utime:  BridgeTimeval::from_host(&usage.ru_utime),
             ru_stime:  BridgeTimeval::from_host(&usage.ru_stime),
             ru_maxrss: usage.ru_maxrss as i64,
             ru_minflt: usage.ru_minflt as i64,
             ru_majflt: usage.ru_majflt as i64,
             ru_nvcsw:  usage.ru_nvcsw as i64,
             ru_nivcsw: usage.ru_nivcsw as i64}
    }

    pub fn encode(&self, writer: &mut MessageWriter) {
        for value in [self.ru_utime.tv_sec, self.ru_utime.tv_usec,
                      self.ru_stime.tv_sec, self.ru_stime.tv_usec,
                      self.ru_maxrss, self.ru_minflt, self.ru_majflt,
                      self.ru_nvcsw, self.ru_nivcsw] {
            writer.push(value);
        }
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        let mut v = [0i64; 9];
        for slot in v.iter_mut() {
            *slot = reader.next::<i64>()?;
        }
        Ok(Self{ru_utime:  BridgeTimeval{tv_sec: v[0], tv_usec: v[1]},
                ru_stime:  BridgeTimeval{tv_sec: v[2], tv_usec: v[3]},
                ru_maxrss: v[4],
                ru_minflt: v[5],
                ru_majflt: v[6],
                ru_nvcsw:  v[7],
                ru_nivcsw: v[8]})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fuzz;
    use crate::bridge::signal::BRIDGE_SIGKILL;

    #[test]
    fn wait_options_round_trip() {
        fuzz::bitset_round_trip(WAIT_OPTION_TABLE,
                                |h| to_bridge_wait_options(h as i32) as i64,
                                |b| from_bridge_wait_options(b as i32) as i64);
    }

    #[test]
    fn exit_status_round_trip() {
        let host = 3 << 8;
        let status = BridgeWStatus::from_host(host);
        assert!(status.exited());
        assert_eq!(status.code, 3);
        assert_eq!(status.to_host(), host);
    }

    #[test]
    fn signal_status_carries_bridge_signal() {
        let host = libc::SIGKILL;
        let status = BridgeWStatus::from_host(host);
        assert!(status.signaled());
        assert_eq!(status.code as i32, BRIDGE_SIGKILL);
        assert_eq!(status.to_host(), host);
    }

    #[test]
    fn stopped_status_round_trip() {
        let host = (libc::SIGSTOP << 8) | 0x7f;
        assert_eq!(BridgeWStatus::from_host(host).to_host(), host);
    }

    #[test]
    fn rusage_encoding() {
        let usage = BridgeRUsage{ru_utime: BridgeTimeval{tv_sec: 1, tv_usec: 2},
                                 ru_maxrss: 4096,
                                 ..Default::default()};
        let mut writer = MessageWriter::new();
        usage.encode(&mut writer);
        let mut reader = MessageReader::from(writer);
        assert_eq!(BridgeRUsage::decode(&mut reader).unwrap(), usage);
    }
}
