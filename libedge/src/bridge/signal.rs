//! Signal numbers, codes, sets, flags and signal descriptors
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use super::{Table, bits_from_bridge, bits_to_bridge, const_from_bridge, const_to_bridge};
use crate::Error;
use crate::message::{MessageReader, MessageWriter};

pub const BRIDGE_SIGHUP:    i32 = 1;
pub const BRIDGE_SIGINT:    i32 = 2;
pub const BRIDGE_SIGQUIT:   i32 = 3;
pub const BRIDGE_SIGILL:    i32 = 4;
pub const BRIDGE_SIGTRAP:   i32 = 5;
pub const BRIDGE_SIGABRT:   i32 = 6;
pub const BRIDGE_SIGBUS:    i32 = 7;
pub const BRIDGE_SIGFPE:    i32 = 8;
pub const BRIDGE_SIGKILL:   i32 = 9;
pub const BRIDGE_SIGUSR1:   i32 = 10;
pub const BRIDGE_SIGSEGV:   i32 = 11;
pub const BRIDGE_SIGUSR2:   i32 = 12;
pub const BRIDGE_SIGPIPE:   i32 = 13;
pub const BRIDGE_SIGALRM:   i32 = 14;
pub const BRIDGE_SIGTERM:   i32 = 15;
pub const BRIDGE_SIGCHLD:   i32 = 16;
pub const BRIDGE_SIGCONT:   i32 = 17;
pub const BRIDGE_SIGSTOP:   i32 = 18;
pub const BRIDGE_SIGTSTP:   i32 = 19;
pub const BRIDGE_SIGTTIN:   i32 = 20;
pub const BRIDGE_SIGTTOU:   i32 = 21;
pub const BRIDGE_SIGURG:    i32 = 22;
pub const BRIDGE_SIGXCPU:   i32 = 23;
pub const BRIDGE_SIGXFSZ:   i32 = 24;
pub const BRIDGE_SIGVTALRM: i32 = 25;
pub const BRIDGE_SIGPROF:   i32 = 26;
pub const BRIDGE_SIGWINCH:  i32 = 27;
pub const BRIDGE_SIGSYS:    i32 = 28;
pub const BRIDGE_SIGRTMIN:  i32 = 32;
pub const BRIDGE_SIGRTMAX:  i32 = 64;

pub(crate) const SIGNAL_TABLE: &Table = &[
    (BRIDGE_SIGHUP as i64,    libc::SIGHUP as i64),
    (BRIDGE_SIGINT as i64,    libc::SIGINT as i64),
    (BRIDGE_SIGQUIT as i64,   libc::SIGQUIT as i64),
    (BRIDGE_SIGILL as i64,    libc::SIGILL as i64),
    (BRIDGE_SIGTRAP as i64,   libc::SIGTRAP as i64),
    (BRIDGE_SIGABRT as i64,   libc::SIGABRT as i64),
    (BRIDGE_SIGBUS as i64,    libc::SIGBUS as i64),
    (BRIDGE_SIGFPE as i64,    libc::SIGFPE as i64),
    (BRIDGE_SIGKILL as i64,   libc::SIGKILL as i64),
    (BRIDGE_SIGUSR1 as i64,   libc::SIGUSR1 as i64),
    (BRIDGE_SIGSEGV as i64,   libc::SIGSEGV as i64),
    (BRIDGE_SIGUSR2 as i64,   libc::SIGUSR2 as i64),
    (BRIDGE_SIGPIPE as i64,   libc::SIGPIPE as i64),
    (BRIDGE_SIGALRM as i64,   libc::SIGALRM as i64),
    (BRIDGE_SIGTERM as i64,   libc::SIGTERM as i64),
    (BRIDGE_SIGCHLD as i64,   libc::SIGCHLD as i64),
    (BRIDGE_SIGCONT as i64,   libc::SIGCONT as i64),
    (BRIDGE_SIGSTOP as i64,   libc::SIGSTOP as i64),
    (BRIDGE_SIGTSTP as i64,   libc::SIGTSTP as i64),
    (BRIDGE_SIGTTIN as i64,   libc::SIGTTIN as i64),
    (BRIDGE_SIGTTOU as i64,   libc::SIGTTOU as i64),
    (BRIDGE_SIGURG as i64,    libc::SIGURG as i64),
    (BRIDGE_SIGXCPU as i64,   libc::SIGXCPU as i64),
    (BRIDGE_SIGXFSZ as i64,   libc::SIGXFSZ as i64),
    (BRIDGE_SIGVTALRM as i64, libc::SIGVTALRM as i64),
    (BRIDGE_SIGPROF as i64,   libc::SIGPROF as i64),
    (BRIDGE_SIGWINCH as i64,  libc::SIGWINCH as i64),
    (BRIDGE_SIGSYS as i64,    libc::SIGSYS as i64),
];

/// Translate a host signal number, -1 when it has no bridge number
pub fn to_bridge_signal(host: i32) -> i32 {
    let rtmin = libc::SIGRTMIN();
    let rtmax = libc::SIGRTMAX();
    if host >= rtmin && host <= rtmax {
        let bridge = BRIDGE_SIGRTMIN + (host - rtmin);
        return if bridge <= BRIDGE_SIGRTMAX { bridge } else { -1 };
    }

    const_to_bridge(host as i64, SIGNAL_TABLE, -1) as i32
}

/// Translate a bridge signal number, -1 when the host has no such signal
pub fn from_bridge_signal(bridge: i32) -> i32 {
    if bridge >= BRIDGE_SIGRTMIN && bridge <= BRIDGE_SIGRTMAX {
        let host = libc::SIGRTMIN() + (bridge - BRIDGE_SIGRTMIN);
        return if host <= libc::SIGRTMAX() { host } else { -1 };
    }

    const_from_bridge(bridge as i64, SIGNAL_TABLE, -1) as i32
}

pub const BRIDGE_SI_USER:    i32 = 1;
pub const BRIDGE_SI_QUEUE:   i32 = 2;
pub const BRIDGE_SI_TIMER:   i32 = 3;
pub const BRIDGE_SI_ASYNCIO: i32 = 4;
pub const BRIDGE_SI_MESGQ:   i32 = 5;

/* Linux si_code values */
const SI_USER:    i32 = 0;
const SI_QUEUE:   i32 = -1;
const SI_TIMER:   i32 = -2;
const SI_MESGQ:   i32 = -3;
const SI_ASYNCIO: i32 = -4;

pub(crate) const SIGNAL_CODE_TABLE: &Table = &[
    (BRIDGE_SI_USER as i64,    SI_USER as i64),
    (BRIDGE_SI_QUEUE as i64,   SI_QUEUE as i64),
    (BRIDGE_SI_TIMER as i64,   SI_TIMER as i64),
    (BRIDGE_SI_ASYNCIO as i64, SI_ASYNCIO as i64),
    (BRIDGE_SI_MESGQ as i64,   SI_MESGQ as i64),
];

/// Translate a host `si_code`, -1 when it has no bridge value
pub fn to_bridge_signal_code(host: i32) -> i32 {
    const_to_bridge(host as i64, SIGNAL_CODE_TABLE, -1) as i32
}

/// Translate a bridge signal code, -1 when it has no host value
pub fn from_bridge_signal_code(bridge: i32) -> i32 {
    const_from_bridge(bridge as i64, SIGNAL_CODE_TABLE, -1) as i32
}

pub const BRIDGE_SA_NOCLDSTOP: i32 = 0x01;
pub const BRIDGE_SA_NOCLDWAIT: i32 = 0x02;
pub const BRIDGE_SA_SIGINFO:   i32 = 0x04;
pub const BRIDGE_SA_ONSTACK:   i32 = 0x08;
pub const BRIDGE_SA_RESTART:   i32 = 0x10;
pub const BRIDGE_SA_NODEFER:   i32 = 0x20;
pub const BRIDGE_SA_RESETHAND: i32 = 0x40;

pub(crate) const SIGNAL_FLAG_TABLE: &Table = &[
    (BRIDGE_SA_NOCLDSTOP as i64, libc::SA_NOCLDSTOP as i64),
    (BRIDGE_SA_NOCLDWAIT as i64, libc::SA_NOCLDWAIT as i64),
    (BRIDGE_SA_SIGINFO as i64,   libc::SA_SIGINFO as i64),
    (BRIDGE_SA_ONSTACK as i64,   libc::SA_ONSTACK as i64),
    (BRIDGE_SA_RESTART as i64,   libc::SA_RESTART as i64),
    (BRIDGE_SA_NODEFER as i64,   libc::SA_NODEFER as i64),
    (BRIDGE_SA_RESETHAND as i64, libc::SA_RESETHAND as i64),
];

pub fn to_bridge_signal_flags(host: i32) -> i32 {
    bits_to_bridge(host as i64, SIGNAL_FLAG_TABLE) as i32
}

pub fn from_bridge_signal_flags(bridge: i32) -> i32 {
    bits_from_bridge(bridge as i64, SIGNAL_FLAG_TABLE) as i32
}

/// Set of bridge signals, bit `n - 1` for signal `n`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BridgeSigSet(pub u64);

impl BridgeSigSet {
    pub fn empty() -> Self {
        BridgeSigSet(0)
    }

    pub fn add(&mut self, signum: i32) -> Result<(), Error> {
        self.0 |= Self::bit(signum)?;
        Ok(())
    }

    pub fn remove(&mut self, signum: i32) -> Result<(), Error> {
        self.0 &= !Self::bit(signum)?;
        Ok(())
    }

    pub fn contains(&self, signum: i32) -> bool {
        Self::bit(signum).map_or(false, |bit| self.0 & bit != 0)
    }

    /// Bridge signal numbers in the set, ascending
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        (1 ..= 64).filter(move |signum| self.contains(*signum))
    }

    fn bit(signum: i32) -> Result<u64, Error> {
        if signum < 1 || signum > 64 {
            return Err(Error::InvalidArgument(format!("signal {} out of range", signum)));
        }
        Ok(1u64 << (signum - 1))
    }

    /// Host signal set. Signals without a host number are skipped.
    pub fn to_host(&self) -> libc::sigset_t {
        let mut set: libc::sigset_t = unsafe { core::mem::zeroed() };
        unsafe { libc::sigemptyset(&mut set) };
        for signum in self.iter() {
            let host = from_bridge_signal(signum);
            if host > 0 {
                unsafe { libc::sigaddset(&mut set, host) };
            }
        }
        set
    }

    pub fn from_host(set: &libc::sigset_t) -> Self {
        let mut bridge = Self::empty();
        for host in 1 .. libc::SIGRTMAX() + 1 {
            if unsafe { libc::sigismember(set, host) } == 1 {
                let signum = to_bridge_signal(host);
                if signum > 0 {
                    let _ = bridge.add(signum);
                }
            }
        }
        bridge
    }
}

/// Bridge form of `siginfo_t`, the fields the enclave uses
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct BridgeSigInfo {
    pub si_signo: i32,
    pub si_code:  i32,
}

impl BridgeSigInfo {
    pub fn from_host(info: &libc::siginfo_t) -> Self {
        Self{si_signo: to_bridge_signal(info.si_signo),
             si_code:  to_bridge_signal_code(info.si_code)}
    }
}

/// Descriptor of a trusted signal handler, sent when registering it
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeSignalHandler {
    /// Direct-call entry for simulation mode, zero when absent
    pub sigaction: u64,
    /// Signals blocked while the handler runs
    pub mask:      BridgeSigSet,
    /// Bridge `SA_*` flags
    pub flags:     i32,
}

impl BridgeSignalHandler {
    pub fn encode(&self, writer: &mut MessageWriter) {
        writer.push(self.sigaction);
        writer.push(self.mask.0);
        writer.push(self.flags);
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        Ok(Self{sigaction: reader.next::<u64>()?,
                mask:      BridgeSigSet(reader.next::<u64>()?),
                flags:     reader.next::<i32>()?})
    }
}

/// A signal delivered into the enclave
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnclaveSignal {
    /// Bridge signal number
    pub signum: i32,
    /// Bridge signal code
    pub code:   i32,
    /// General purpose registers of the interrupted context, may be empty
    pub gregs:  Vec<u64>,
}

impl EnclaveSignal {
    pub fn encode(&self, writer: &mut MessageWriter) {
        writer.push(self.signum);
        writer.push(self.code);
        let regs: Vec<u8> = self.gregs.iter().flat_map(|r| r.to_le_bytes()).collect();
        writer.push_bytes(&regs);
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        let signum = reader.next::<i32>()?;
        let code   = reader.next::<i32>()?;
        let regs   = reader.next_extent()?;
        if regs.len() % 8 != 0 {
            return Err(Error::Malformed("register block not a multiple of 8".into()));
        }

        let gregs = regs.chunks_exact(8)
                        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3],
                                                     c[4], c[5], c[6], c[7]]))
                        .collect();
        Ok(Self{signum: signum, code: code, gregs: gregs})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fuzz;

    #[test]
    fn signal_numbers_round_trip() {
        for (bridge, host) in SIGNAL_TABLE {
            assert_eq!(from_bridge_signal(to_bridge_signal(*host as i32)), *host as i32);
            assert_eq!(to_bridge_signal(from_bridge_signal(*bridge as i32)), *bridge as i32);
        }
        for bridge in BRIDGE_SIGRTMIN ..= BRIDGE_SIGRTMAX {
            let host = from_bridge_signal(bridge);
            if host > 0 {
                assert_eq!(to_bridge_signal(host), bridge);
            }
        }
    }

    #[test]
    fn unknown_signals_use_fallback() {
        assert_eq!(to_bridge_signal(0), -1);
        assert_eq!(to_bridge_signal(-5), -1);
        assert_eq!(from_bridge_signal(29), -1);
        assert_eq!(from_bridge_signal(BRIDGE_SIGRTMAX + 1), -1);
    }

    #[test]
    fn realtime_signals_map_by_offset() {
        assert_eq!(to_bridge_signal(libc::SIGRTMIN()), BRIDGE_SIGRTMIN);
        assert_eq!(from_bridge_signal(BRIDGE_SIGRTMIN + 2), libc::SIGRTMIN() + 2);
        assert_eq!(to_bridge_signal(libc::SIGRTMAX() + 1), -1);
    }

    #[test]
    fn signal_codes_round_trip() {
        fuzz::constant_round_trip(SIGNAL_CODE_TABLE, -1,
                                  |h| to_bridge_signal_code(h as i32) as i64,
                                  |b| from_bridge_signal_code(b as i32) as i64);
    }

    #[test]
    fn signal_flags_round_trip() {
        fuzz::bitset_round_trip(SIGNAL_FLAG_TABLE,
                                |h| to_bridge_signal_flags(h as i32) as i64,
                                |b| from_bridge_signal_flags(b as i32) as i64);
    }

    #[test]
    fn sigset_translates_members() {
        let mut set = BridgeSigSet::empty();
        set.add(BRIDGE_SIGUSR1).unwrap();
        set.add(BRIDGE_SIGCHLD).unwrap();

        let host = set.to_host();
        assert_eq!(unsafe { libc::sigismember(&host, libc::SIGUSR1) }, 1);
        assert_eq!(unsafe { libc::sigismember(&host, libc::SIGCHLD) }, 1);
        assert_eq!(unsafe { libc::sigismember(&host, libc::SIGTERM) }, 0);
        assert_eq!(BridgeSigSet::from_host(&host), set);
    }

    #[test]
    fn sigset_rejects_out_of_range() {
        let mut set = BridgeSigSet::empty();
        assert!(set.add(0).is_err());
        assert!(set.add(65).is_err());
        assert!(!set.contains(65));
    }

    #[test]
    fn enclave_signal_encoding() {
        let signal = EnclaveSignal{signum: BRIDGE_SIGUSR2,
                                   code:   BRIDGE_SI_QUEUE,
                                   gregs:  vec![1, 2, u64::MAX]};
        let mut writer = MessageWriter::new();
        signal.encode(&mut writer);
        let mut reader = MessageReader::from(writer);
        assert_eq!(EnclaveSignal::decode(&mut reader).unwrap(), signal);
    }
}
