//! Memory layout, encrypted snapshot layout and fork handshake messages
//!
//! A snapshot holds one entry per enclave memory region. Each entry's
//! ciphertext and nonce live in `HostBuffer`s on the untrusted heap. When
//! the enclave returns a snapshot the ownership of these buffers moves to
//! the host (`into_message` / `from_message`); when the host asks an enclave
//! to restore from a snapshot it only lends them (`lend` /
//! `borrow_entries`).
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use crate::Error;
use crate::alloc::HostBuffer;
use crate::message::{MessageReader, MessageWriter};

/// Kind of an enclave memory region
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RegionKind {
    Data   = 0,
    Bss    = 1,
    Heap   = 2,
    Thread = 3,
    Stack  = 4,
}

impl RegionKind {
    pub const ALL: [RegionKind; 5] = [RegionKind::Data, RegionKind::Bss, RegionKind::Heap,
                                      RegionKind::Thread, RegionKind::Stack];

    pub fn from_u32(value: u32) -> Result<Self, Error> {
        RegionKind::ALL.iter()
                       .copied()
                       .find(|k| *k as u32 == value)
                       .ok_or_else(|| Error::Malformed(format!("region kind {}", value)))
    }
}

/// One region of enclave memory
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: RegionKind,
    pub base: usize,
    pub size: usize,
}

impl MemoryRegion {

    /// Bytes binding a ciphertext to this region
    pub fn associated_data(&self) -> Vec<u8> {
        let mut ad = Vec::with_capacity(20);
        ad.extend_from_slice(&(self.kind as u32).to_le_bytes());
        ad.extend_from_slice(&(self.base as u64).to_le_bytes());
        ad.extend_from_slice(&(self.size as u64).to_le_bytes());
        ad
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    fn encode(&self, writer: &mut MessageWriter) {
        writer.push(self.kind as u32);
        writer.push(self.base as u64);
        writer.push(self.size as u64);
    }

    fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        Ok(Self{kind: RegionKind::from_u32(reader.next()?)?,
                base: reader.next::<u64>()? as usize,
                size: reader.next::<u64>()? as usize})
    }
}

/// Regions of an enclave's memory, in ascending address order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    regions: Vec<MemoryRegion>,
}

impl MemoryLayout {

    /// Split an enclave image into its regions
    ///
    /// Data, bss, thread and stack get one eighth of the image each, heap
    /// gets the rest. Region boundaries are aligned to `page`.
    ///
    /// # Inputs
    /// * 'base' is the enclave base address, aligned to `page`
    /// * 'size' is the enclave size, at least eight pages
    /// * 'page' is the page size, a power of two
    ///
    /// # Returns
    ///
    /// The layout, or Err(Error::InvalidArgument) for a bad base or size

    pub fn partition(base: usize, size: usize, page: usize) -> Result<Self, Error> {
        if !page.is_power_of_two() || base & (page - 1) != 0 || size < 8 * page {
            return Err(Error::InvalidArgument(
                format!("cannot partition {:#x}+{:#x} into pages of {:#x}", base, size, page)));
        }

        let eighth = (size / 8) & !(page - 1);
        let sizes = [eighth, eighth, size - 4 * eighth, eighth, eighth];
        let mut regions = Vec::with_capacity(sizes.len());
        let mut next = base;
        for (kind, len) in RegionKind::ALL.iter().zip(sizes.iter()) {
            regions.push(MemoryRegion{kind: *kind, base: next, size: *len});
            next += len;
        }

        Ok(Self{regions: regions})
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn region(&self, kind: RegionKind) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.kind == kind)
    }

    pub fn base(&self) -> usize {
        self.regions.first().map_or(0, |r| r.base)
    }

    pub fn size(&self) -> usize {
        self.regions.last().map_or(0, |r| r.end()) - self.base()
    }

    /// Whether `[addr, addr + len)` lies inside the enclave
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base() && end <= self.base() + self.size(),
            None      => false,
        }
    }
}

/// Encrypted copy of one memory region
#[derive(Debug)]
pub struct SnapshotEntry {
    pub region:     MemoryRegion,
    pub ciphertext: HostBuffer,
    pub nonce:      HostBuffer,
}

/// Encrypted copy of all memory regions of an enclave
#[derive(Debug, Default)]
pub struct SnapshotLayout {
    pub entries: Vec<SnapshotEntry>,
}

impl SnapshotLayout {

    pub fn entry(&self, kind: RegionKind) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.region.kind == kind)
    }

    /// Append the layout and hand its buffers over to the receiver
    pub fn into_message(self, writer: &mut MessageWriter) {
        writer.push(self.entries.len() as u32);
        for entry in self.entries {
            entry.region.encode(writer);
            push_raw(writer, entry.ciphertext.into_raw());
            push_raw(writer, entry.nonce.into_raw());
        }
    }

    /// Take ownership of a layout sent with `into_message`
    ///
    /// # Safety
    ///
    /// The message must come from `into_message` in this process, and must
    /// be consumed only once.

    pub unsafe fn from_message(reader: &mut MessageReader) -> Result<Self, Error> {
        let count = reader.next::<u32>()? as usize;
        let mut entries = Vec::with_capacity(count.min(RegionKind::ALL.len()));
        let mut failure = None;
        for _ in 0 .. count {
            /* Buffers are owned before the entry is validated, so every
               buffer in a well-formed message is freed on failure */
            let kind       = reader.next::<u32>()?;
            let base       = reader.next::<u64>()? as usize;
            let size       = reader.next::<u64>()? as usize;
            let ciphertext = next_buffer(reader)?;
            let nonce      = next_buffer(reader)?;

            match (RegionKind::from_u32(kind), ciphertext, nonce) {
                (Ok(kind), Some(ciphertext), Some(nonce)) => {
                    let region = MemoryRegion{kind: kind, base: base, size: size};
                    entries.push(SnapshotEntry{region: region, ciphertext: ciphertext, nonce: nonce});
                },
                (Err(err), _, _) => {
                    failure.get_or_insert(err);
                },
                _ => {
                    failure.get_or_insert(Error::InvalidArgument("null or empty snapshot buffer".into()));
                },
            }
        }

        return match failure {
            Some(err) => Err(err),
            None      => Ok(Self{entries: entries}),
        };
    }

    /// Append the layout without giving up the buffers
    pub fn lend(&self, writer: &mut MessageWriter) {
        writer.push(self.entries.len() as u32);
        for entry in &self.entries {
            entry.region.encode(writer);
            push_raw(writer, (entry.ciphertext.addr() as *mut u8, entry.ciphertext.len()));
            push_raw(writer, (entry.nonce.addr() as *mut u8, entry.nonce.len()));
        }
    }
}

/// Borrowed view of one lent snapshot entry
#[derive(Copy, Clone, Debug)]
pub struct SnapshotEntryRef<'a> {
    pub region:     MemoryRegion,
    pub ciphertext: &'a [u8],
    pub nonce:      &'a [u8],
}

/// Read a layout sent with `SnapshotLayout::lend`
///
/// # Safety
///
/// The lending `SnapshotLayout` must outlive `'a` and must not be modified
/// while the returned views exist.

pub unsafe fn borrow_entries<'a>(reader: &mut MessageReader)
                                 -> Result<Vec<SnapshotEntryRef<'a>>, Error> {
    let count = reader.next::<u32>()? as usize;
    let mut entries = Vec::with_capacity(count.min(RegionKind::ALL.len()));
    for _ in 0 .. count {
        let region = MemoryRegion::decode(reader)?;
        let (ptr, len) = next_raw(reader)?;
        let ciphertext = view(ptr, len)?;
        let (ptr, len) = next_raw(reader)?;
        let nonce = view(ptr, len)?;
        entries.push(SnapshotEntryRef{region: region, ciphertext: ciphertext, nonce: nonce});
    }
    Ok(entries)
}

unsafe fn view<'a>(ptr: *mut u8, len: usize) -> Result<&'a [u8], Error> {
    if ptr.is_null() {
        return Err(Error::Malformed("null snapshot buffer".into()));
    }
    Ok(core::slice::from_raw_parts(ptr, len))
}

fn push_raw(writer: &mut MessageWriter, (ptr, len): (*mut u8, usize)) {
    writer.push(ptr as u64);
    writer.push(len as u64);
}

fn next_raw(reader: &mut MessageReader) -> Result<(*mut u8, usize), Error> {
    let ptr = reader.next::<u64>()? as usize as *mut u8;
    let len = reader.next::<u64>()? as usize;
    Ok((ptr, len))
}

/* Owned buffer handed over with `into_raw`, None if null or empty */
unsafe fn next_buffer(reader: &mut MessageReader) -> Result<Option<HostBuffer>, Error> {
    let (ptr, len) = next_raw(reader)?;
    if len == 0 && !ptr.is_null() {
        libc::free(ptr as *mut libc::c_void);
        return Ok(None);
    }
    Ok(HostBuffer::from_raw(ptr, len).ok())
}

/// Parameters of the snapshot key transfer, one per side of a fork
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ForkHandshakeConfig {
    /// Whether this side sends the key
    pub is_parent: bool,
    /// Host descriptor of this side's socket
    pub socket:    i32,
}

impl ForkHandshakeConfig {
    pub fn encode(&self, writer: &mut MessageWriter) {
        writer.push(self.is_parent);
        writer.push(self.socket);
    }

    pub fn decode(reader: &mut MessageReader) -> Result<Self, Error> {
        Ok(Self{is_parent: reader.next()?, socket: reader.next()?})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn partition_covers_the_image() {
        let layout = MemoryLayout::partition(0x10_0000, 64 * PAGE, PAGE).unwrap();
        assert_eq!(layout.regions().len(), 5);
        assert_eq!(layout.base(), 0x10_0000);
        assert_eq!(layout.size(), 64 * PAGE);

        let mut next = layout.base();
        for region in layout.regions() {
            assert_eq!(region.base, next);
            assert_eq!(region.base % PAGE, 0);
            next = region.end();
        }
        assert_eq!(layout.region(RegionKind::Heap).unwrap().size, 32 * PAGE);
    }

    #[test]
    fn partition_rejects_small_or_unaligned() {
        assert!(MemoryLayout::partition(0x1000, 4 * PAGE, PAGE).is_err());
        assert!(MemoryLayout::partition(0x1001, 64 * PAGE, PAGE).is_err());
    }

    #[test]
    fn contains_checks_bounds() {
        let layout = MemoryLayout::partition(0x10_0000, 8 * PAGE, PAGE).unwrap();
        assert!(layout.contains(0x10_0000, 8 * PAGE));
        assert!(!layout.contains(0x10_0000, 8 * PAGE + 1));
        assert!(!layout.contains(usize::MAX, 2));
    }

    #[test]
    fn ownership_moves_with_the_message() {
        let region = MemoryRegion{kind: RegionKind::Stack, base: 0x2000, size: 16};
        let layout = SnapshotLayout{entries: vec![SnapshotEntry{
            region:     region,
            ciphertext: HostBuffer::from_slice(b"sealed").unwrap(),
            nonce:      HostBuffer::from_slice(&[7u8; 12]).unwrap(),
        }]};

        let mut writer = MessageWriter::new();
        layout.into_message(&mut writer);
        let mut reader = MessageReader::from(writer);
        let owned = unsafe { SnapshotLayout::from_message(&mut reader) }.unwrap();
        assert_eq!(owned.entry(RegionKind::Stack).unwrap().ciphertext.as_slice(), b"sealed");

        let mut writer = MessageWriter::new();
        owned.lend(&mut writer);
        let mut reader = MessageReader::from(writer);
        let views = unsafe { borrow_entries(&mut reader) }.unwrap();
        assert_eq!(views[0].region, region);
        assert_eq!(views[0].nonce, &[7u8; 12]);
    }

    fn push_entry(writer: &mut MessageWriter, kind: u32, sealed: &[u8]) {
        writer.push(kind);
        writer.push(0x2000u64);
        writer.push(16u64);
        push_raw(writer, HostBuffer::from_slice(sealed).unwrap().into_raw());
        push_raw(writer, HostBuffer::from_slice(&[7u8; 12]).unwrap().into_raw());
    }

    #[test]
    fn bad_entry_still_takes_every_buffer() {
        let mut writer = MessageWriter::new();
        writer.push(3u32);
        push_entry(&mut writer, RegionKind::Data as u32, b"first");
        push_entry(&mut writer, 99, b"second");
        push_entry(&mut writer, RegionKind::Heap as u32, b"third");

        let mut reader = MessageReader::from(writer);
        let result = unsafe { SnapshotLayout::from_message(&mut reader) };
        assert!(matches!(result, Err(Error::Malformed(_))));
        /* The entry after the bad one was read and owned too */
        assert!(!reader.has_next());
    }

    #[test]
    fn null_buffer_fails_the_layout() {
        let mut writer = MessageWriter::new();
        writer.push(2u32);
        push_entry(&mut writer, RegionKind::Data as u32, b"first");
        writer.push(RegionKind::Bss as u32);
        writer.push(0x3000u64);
        writer.push(16u64);
        push_raw(&mut writer, HostBuffer::from_slice(b"second").unwrap().into_raw());
        push_raw(&mut writer, (core::ptr::null_mut(), 12));

        let mut reader = MessageReader::from(writer);
        let result = unsafe { SnapshotLayout::from_message(&mut reader) };
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(!reader.has_next());
    }

    #[test]
    fn truncated_layout_is_rejected() {
        let mut writer = MessageWriter::new();
        writer.push(2u32);
        push_entry(&mut writer, RegionKind::Data as u32, b"first");
        writer.push(RegionKind::Bss as u32);

        let mut reader = MessageReader::from(writer);
        assert!(unsafe { SnapshotLayout::from_message(&mut reader) }.is_err());
    }

    #[test]
    fn handshake_config_encoding() {
        let config = ForkHandshakeConfig{is_parent: true, socket: 9};
        let mut writer = MessageWriter::new();
        config.encode(&mut writer);
        let mut reader = MessageReader::from(writer);
        assert_eq!(ForkHandshakeConfig::decode(&mut reader).unwrap(), config);
    }
}
