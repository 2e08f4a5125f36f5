//! Bridge types and their translation to and from host native values
//!
//! Bridge values have a fixed layout and fixed constant numbering on both
//! sides of the boundary. Numeric values of host constants are not assumed
//! to match: bitsets are translated bit by bit through lookup tables, and
//! enumerated constants without a counterpart translate to an explicit
//! fallback.
//!
//! Naming: `to_bridge_*` converts a host native value into its bridge form,
//! `from_bridge_*` converts a bridge value into the host native form.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use log::trace;

pub mod cpuset;
pub mod fs;
pub mod signal;
pub mod socket;
pub mod sys;
pub mod syslog;
pub mod wait;

pub use cpuset::CpuSet;

/// Table of (bridge, host) constant pairs
pub(crate) type Table = [(i64, i64)];

/// Translate a host bitset. Each table entry whose host bits are all present
/// contributes its bridge bits; unknown host bits are dropped.
pub(crate) fn bits_to_bridge(host: i64, table: &Table) -> i64 {
    table.iter()
         .filter(|(_, h)| *h != 0 && host & *h == *h)
         .fold(0, |acc, (b, _)| acc | *b)
}

/// Translate a bridge bitset. Inverse of `bits_to_bridge`.
pub(crate) fn bits_from_bridge(bridge: i64, table: &Table) -> i64 {
    table.iter()
         .filter(|(b, _)| *b != 0 && bridge & *b == *b)
         .fold(0, |acc, (_, h)| acc | *h)
}

/// Translate a host constant, `fallback` when it has no bridge value
pub(crate) fn const_to_bridge(host: i64, table: &Table, fallback: i64) -> i64 {
    match table.iter().find(|(_, h)| *h == host) {
        Some((bridge, _)) => *bridge,
        None => {
            trace!("host constant {} has no bridge value, using {}", host, fallback);
            fallback
        },
    }
}

/// Translate a bridge constant, `fallback` when it has no host value
pub(crate) fn const_from_bridge(bridge: i64, table: &Table, fallback: i64) -> i64 {
    match table.iter().find(|(b, _)| *b == bridge) {
        Some((_, host)) => *host,
        None => {
            trace!("bridge constant {} has no host value, using {}", bridge, fallback);
            fallback
        },
    }
}

/// Bridge form of `struct timeval`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BridgeTimeval {
    pub tv_sec:  i64,
    pub tv_usec: i64,
}

impl BridgeTimeval {
    pub fn to_host(&self) -> libc::timeval {
        libc::timeval{tv_sec:  self.tv_sec as libc::time_t,
                      tv_usec: self.tv_usec as libc::suseconds_t}
    }

    pub fn from_host(tv: &libc::timeval) -> Self {
        Self{tv_sec: tv.tv_sec as i64, tv_usec: tv.tv_usec as i64}
    }
}

/// Bridge form of `struct timespec`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BridgeTimespec {
    pub tv_sec:  i64,
    pub tv_nsec: i64,
}

impl BridgeTimespec {
    pub fn to_host(&self) -> libc::timespec {
        libc::timespec{tv_sec:  self.tv_sec as libc::time_t,
                       tv_nsec: self.tv_nsec as _}
    }

    pub fn from_host(ts: &libc::timespec) -> Self {
        Self{tv_sec: ts.tv_sec as i64, tv_nsec: ts.tv_nsec as i64}
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &Table = &[(0x1, 0x10), (0x2, 0x20), (0x6, 0x60)];

    #[test]
    fn multi_bit_entries_translate_as_a_unit() {
        assert_eq!(bits_to_bridge(0x60, TABLE), 0x6);
        assert_eq!(bits_from_bridge(0x6, TABLE), 0x60);
        assert_eq!(bits_to_bridge(0x30, TABLE), 0x3);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        assert_eq!(bits_to_bridge(0x10 | 0x1000, TABLE), 0x1);
    }

    #[test]
    fn unknown_constants_use_fallback() {
        assert_eq!(const_to_bridge(0x99, TABLE, -1), -1);
        assert_eq!(const_from_bridge(0x2, TABLE, -1), 0x20);
    }

    #[test]
    fn timeval_round_trip() {
        let tv = BridgeTimeval{tv_sec: 12, tv_usec: 345};
        assert_eq!(BridgeTimeval::from_host(&tv.to_host()), tv);
    }
}
