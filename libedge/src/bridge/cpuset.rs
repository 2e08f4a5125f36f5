//! Fixed-width CPU affinity set
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use crate::Error;
use crate::message::{MessageReader, MessageWriter};

const WORD_BITS: usize = 64;
const WORDS:     usize = CpuSet::SIZE / WORD_BITS;

/// Set of CPU numbers below `CpuSet::SIZE`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct CpuSet {
    words: [u64; WORDS],
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSet {

    /// Number of CPUs the set can hold
    pub const SIZE: usize = 1024;

    pub fn new() -> Self {
        Self{words: [0; WORDS]}
    }

    pub fn zero(&mut self) {
        self.words = [0; WORDS];
    }

    /// Add `cpu`; out of range numbers are ignored
    pub fn set(&mut self, cpu: usize) {
        if cpu < Self::SIZE {
            self.words[cpu / WORD_BITS] |= 1 << (cpu % WORD_BITS);
        }
    }

    /// Remove `cpu`; out of range numbers are ignored
    pub fn clear(&mut self, cpu: usize) {
        if cpu < Self::SIZE {
            self.words[cpu / WORD_BITS] &= !(1 << (cpu % WORD_BITS));
        }
    }

    pub fn is_set(&self, cpu: usize) -> bool {
        cpu < Self::SIZE && self.words[cpu / WORD_BITS] & (1 << (cpu % WORD_BITS)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// CPUs the host set can represent are copied; others are dropped
    pub fn to_host(&self) -> libc::cpu_set_t {
        let mut set: libc::cpu_set_t = unsafe { core::mem::zeroed() };
        let limit = (libc::CPU_SETSIZE as usize).min(Self::SIZE);
        for cpu in (0 .. limit).filter(|cpu| self.is_set(*cpu)) {
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        set
    }

    pub fn from_host(set: &libc::cpu_set_t) -> Self {
        let mut bridge = Self::new();
        let limit = (libc::CPU_SETSIZE as usize).min(Self::SIZE);
        for cpu in (0 .. limit).filter(|cpu| unsafe { libc::CPU_ISSET(*cpu, set) }) {
            bridge.set(cpu);
        }
        bridge
    }

    /// Read a host set returned in raw bytes
    pub fn from_host_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() > core::mem::size_of::<libc::cpu_set_t>() {
            return Err(Error::Malformed("cpu set buffer too large".into()));
        }
        let mut set: libc::cpu_set_t = unsafe { core::mem::zeroed() };
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(),
                                           &mut set as *mut _ as *mut u8,
                                           bytes.len());
        }
        Ok(Self::from_host(&set))
    }

    pub fn encode(&self, writer: &mut MessageWriter) {
        let bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        writer.push_bytes(&bytes);
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        let bytes = reader.next_extent()?;
        if bytes.len() != WORDS * 8 {
            return Err(Error::Malformed("cpu set has the wrong size".into()));
        }

        let mut set = Self::new();
        for (word, chunk) in set.words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Ok(set)
    }
}
