//! Syslog options, facilities, levels and priorities
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use super::{Table, bits_from_bridge, bits_to_bridge, const_from_bridge, const_to_bridge};

pub const BRIDGE_LOG_PID:    i32 = 0x01;
pub const BRIDGE_LOG_CONS:   i32 = 0x02;
pub const BRIDGE_LOG_ODELAY: i32 = 0x04;
pub const BRIDGE_LOG_NDELAY: i32 = 0x08;
pub const BRIDGE_LOG_NOWAIT: i32 = 0x10;
pub const BRIDGE_LOG_PERROR: i32 = 0x20;

pub(crate) const OPTION_TABLE: &Table = &[
    (BRIDGE_LOG_PID as i64,    libc::LOG_PID as i64),
    (BRIDGE_LOG_CONS as i64,   libc::LOG_CONS as i64),
    (BRIDGE_LOG_ODELAY as i64, libc::LOG_ODELAY as i64),
    (BRIDGE_LOG_NDELAY as i64, libc::LOG_NDELAY as i64),
    (BRIDGE_LOG_NOWAIT as i64, libc::LOG_NOWAIT as i64),
    (BRIDGE_LOG_PERROR as i64, libc::LOG_PERROR as i64),
];

pub fn to_bridge_syslog_options(host: i32) -> i32 {
    bits_to_bridge(host as i64, OPTION_TABLE) as i32
}

pub fn from_bridge_syslog_options(bridge: i32) -> i32 {
    bits_from_bridge(bridge as i64, OPTION_TABLE) as i32
}

/* Facilities occupy bits 3.. of a priority, levels bits 0..2 */
const FACILITY_SHIFT: i32 = 3;
const LEVEL_MASK:     i32 = 0x07;

pub const BRIDGE_LOG_USER:   i32 = 1 << FACILITY_SHIFT;
pub const BRIDGE_LOG_LOCAL0: i32 = 2 << FACILITY_SHIFT;
pub const BRIDGE_LOG_LOCAL1: i32 = 3 << FACILITY_SHIFT;
pub const BRIDGE_LOG_LOCAL2: i32 = 4 << FACILITY_SHIFT;
pub const BRIDGE_LOG_LOCAL3: i32 = 5 << FACILITY_SHIFT;
pub const BRIDGE_LOG_LOCAL4: i32 = 6 << FACILITY_SHIFT;
pub const BRIDGE_LOG_LOCAL5: i32 = 7 << FACILITY_SHIFT;
pub const BRIDGE_LOG_LOCAL6: i32 = 8 << FACILITY_SHIFT;
pub const BRIDGE_LOG_LOCAL7: i32 = 9 << FACILITY_SHIFT;

/* Zero means "no facility" on both sides and is also the fallback */
pub(crate) const FACILITY_TABLE: &Table = &[
    (0,                        0),
    (BRIDGE_LOG_USER as i64,   libc::LOG_USER as i64),
    (BRIDGE_LOG_LOCAL0 as i64, libc::LOG_LOCAL0 as i64),
    (BRIDGE_LOG_LOCAL1 as i64, libc::LOG_LOCAL1 as i64),
    (BRIDGE_LOG_LOCAL2 as i64, libc::LOG_LOCAL2 as i64),
    (BRIDGE_LOG_LOCAL3 as i64, libc::LOG_LOCAL3 as i64),
    (BRIDGE_LOG_LOCAL4 as i64, libc::LOG_LOCAL4 as i64),
    (BRIDGE_LOG_LOCAL5 as i64, libc::LOG_LOCAL5 as i64),
    (BRIDGE_LOG_LOCAL6 as i64, libc::LOG_LOCAL6 as i64),
    (BRIDGE_LOG_LOCAL7 as i64, libc::LOG_LOCAL7 as i64),
];

pub fn to_bridge_syslog_facility(host: i32) -> i32 {
    const_to_bridge(host as i64, FACILITY_TABLE, 0) as i32
}

pub fn from_bridge_syslog_facility(bridge: i32) -> i32 {
    const_from_bridge(bridge as i64, FACILITY_TABLE, 0) as i32
}

pub const BRIDGE_LOG_EMERG:   i32 = 0;
pub const BRIDGE_LOG_ALERT:   i32 = 1;
pub const BRIDGE_LOG_CRIT:    i32 = 2;
pub const BRIDGE_LOG_ERR:     i32 = 3;
pub const BRIDGE_LOG_WARNING: i32 = 4;
pub const BRIDGE_LOG_NOTICE:  i32 = 5;
pub const BRIDGE_LOG_INFO:    i32 = 6;
pub const BRIDGE_LOG_DEBUG:   i32 = 7;

pub(crate) const LEVEL_TABLE: &Table = &[
    (BRIDGE_LOG_EMERG as i64,   libc::LOG_EMERG as i64),
    (BRIDGE_LOG_ALERT as i64,   libc::LOG_ALERT as i64),
    (BRIDGE_LOG_CRIT as i64,    libc::LOG_CRIT as i64),
    (BRIDGE_LOG_ERR as i64,     libc::LOG_ERR as i64),
    (BRIDGE_LOG_WARNING as i64, libc::LOG_WARNING as i64),
    (BRIDGE_LOG_NOTICE as i64,  libc::LOG_NOTICE as i64),
    (BRIDGE_LOG_INFO as i64,    libc::LOG_INFO as i64),
    (BRIDGE_LOG_DEBUG as i64,   libc::LOG_DEBUG as i64),
];

pub fn to_bridge_syslog_level(host: i32) -> i32 {
    const_to_bridge(host as i64, LEVEL_TABLE, BRIDGE_LOG_INFO as i64) as i32
}

pub fn from_bridge_syslog_level(bridge: i32) -> i32 {
    const_from_bridge(bridge as i64, LEVEL_TABLE, libc::LOG_INFO as i64) as i32
}

/// Translate a host priority, facility and level separately
pub fn to_bridge_syslog_priority(host: i32) -> i32 {
    to_bridge_syslog_facility(host & !LEVEL_MASK) | to_bridge_syslog_level(host & LEVEL_MASK)
}

/// Translate a bridge priority, facility and level separately
pub fn from_bridge_syslog_priority(bridge: i32) -> i32 {
    from_bridge_syslog_facility(bridge & !LEVEL_MASK)
        | from_bridge_syslog_level(bridge & LEVEL_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fuzz;

    #[test]
    fn options_round_trip() {
        fuzz::bitset_round_trip(OPTION_TABLE,
                                |h| to_bridge_syslog_options(h as i32) as i64,
                                |b| from_bridge_syslog_options(b as i32) as i64);
    }

    #[test]
    fn facilities_round_trip_with_zero_fallback() {
        fuzz::constant_round_trip(FACILITY_TABLE, 0,
                                  |h| to_bridge_syslog_facility(h as i32) as i64,
                                  |b| from_bridge_syslog_facility(b as i32) as i64);
    }

    #[test]
    fn every_priority_pair_round_trips() {
        for (bridge_facility, host_facility) in FACILITY_TABLE {
            for (bridge_level, host_level) in LEVEL_TABLE {
                let host   = (*host_facility | *host_level) as i32;
                let bridge = (*bridge_facility | *bridge_level) as i32;
                assert_eq!(to_bridge_syslog_priority(host), bridge);
                assert_eq!(from_bridge_syslog_priority(bridge), host);
                assert_eq!(from_bridge_syslog_priority(to_bridge_syslog_priority(host)), host);
            }
        }
    }
}
