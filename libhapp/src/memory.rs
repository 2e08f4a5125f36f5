//! Enclave memory for the simulation backend
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use std::ffi::c_void;

use edge::snapshot::MemoryLayout;
use log::{debug, warn};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};

use crate::Error;

const DEFAULT_PAGE_SIZE: usize = 4096;

/// Host page size in bytes
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _                          => DEFAULT_PAGE_SIZE,
    }
}

pub(crate) fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Anonymous private mapping holding one enclave image
#[derive(Debug)]
pub struct EnclaveMemory {
    base: usize,
    size: usize,
}

impl EnclaveMemory {

    /// Map enclave memory
    ///
    /// The mapping is placed at `hint` if that range is free; the kernel
    /// picks another address otherwise, so callers that need a fixed
    /// address must compare `base()` with the hint.
    ///
    /// # Inputs
    /// * 'hint' is the preferred base address
    /// * 'size' is the image size, rounded up to whole pages
    ///
    /// # Returns
    ///
    /// The mapping, or an error if the kernel refused it

    pub fn map(hint: Option<usize>, size: usize) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized enclave".into()));
        }

        let size = round_up(size, page_size());
        let addr = hint.unwrap_or(0) as *mut c_void;
        let ptr = unsafe {
            mmap(addr,
                 size,
                 ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                 MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                 -1,
                 0)
        }.map_err(|errno| Error::posix(errno as i32, "mmap enclave memory"))?;

        let base = ptr as usize;
        if let Some(hint) = hint {
            if hint != base {
                debug!("enclave memory wanted at {:#x}, mapped at {:#x}", hint, base);
            }
        }

        Ok(Self{base: base, size: size})
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Region layout of the image
    pub fn layout(&self) -> Result<MemoryLayout, Error> {
        MemoryLayout::partition(self.base, self.size, page_size())
    }
}

impl Drop for EnclaveMemory {
    fn drop(&mut self) {
        if let Err(errno) = unsafe { munmap(self.base as *mut c_void, self.size) } {
            warn!("munmap of enclave memory at {:#x} failed: {}", self.base, errno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_page_aligned_and_zeroed() {
        let page = page_size();
        let memory = EnclaveMemory::map(None, 8 * page + 1).unwrap();
        assert_eq!(memory.base() % page, 0);
        assert_eq!(memory.size(), 9 * page);

        let bytes = unsafe { std::slice::from_raw_parts(memory.base() as *const u8, memory.size()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn freed_range_can_be_mapped_again() {
        let size = 16 * page_size();
        let first = EnclaveMemory::map(None, size).unwrap();
        let base = first.base();
        drop(first);

        let second = EnclaveMemory::map(Some(base), size).unwrap();
        assert_eq!(second.base(), base);
        assert_eq!(second.layout().unwrap().base(), base);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(EnclaveMemory::map(None, 0).is_err());
    }
}
