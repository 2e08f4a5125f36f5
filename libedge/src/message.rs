//! Push-ordered argument messages exchanged across the boundary
//!
//! A message is an ordered list of extents. The caller pushes extents with a
//! `MessageWriter`, the message is serialized into one flat buffer, and the
//! callee consumes the extents in the same order with a `MessageReader`.
//!
//! Wire format: a little-endian `u64` extent count, followed by each extent as
//! a little-endian `u64` length and the extent bytes.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use crate::Error;

const LEN_SIZE: usize = core::mem::size_of::<u64>();

/// Fixed-size value that can be pushed as a single extent
pub trait Scalar: Copy {
    /// Encoded size in bytes
    const SIZE: usize;
    /// Append little-endian encoding
    fn encode(self, out: &mut Vec<u8>);
    /// Decode from exactly `SIZE` bytes
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! scalar {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                const SIZE: usize = core::mem::size_of::<$t>();

                fn encode(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; core::mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    }
}

scalar!(u8, u16, u32, u64, i8, i16, i32, i64, usize, isize);

impl Scalar for bool {
    const SIZE: usize = 1;

    fn encode(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Builder for an outbound message
#[derive(Default, Clone, Debug)]
pub struct MessageWriter {
    extents: Vec<Vec<u8>>,
}

impl MessageWriter {

    pub fn new() -> Self {
        Self{extents: Vec::new()}
    }

    /// Push a scalar by value
    pub fn push<T: Scalar>(&mut self, value: T) {
        let mut bytes = Vec::with_capacity(T::SIZE);
        value.encode(&mut bytes);
        self.extents.push(bytes);
    }

    /// Push a byte range; the bytes are copied into the message
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.extents.push(bytes.to_vec());
    }

    /// Push a string without terminator
    pub fn push_str(&mut self, value: &str) {
        self.push_bytes(value.as_bytes());
    }

    /// Push an empty extent, used for absent optional values
    pub fn push_empty(&mut self) {
        self.extents.push(Vec::new());
    }

    /// Number of extents pushed so far
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Size of the serialized message in bytes
    pub fn message_size(&self) -> usize {
        if self.extents.is_empty() {
            return 0;
        }

        LEN_SIZE + self.extents.iter().map(|e| LEN_SIZE + e.len()).sum::<usize>()
    }

    /// Serialize into `to`, which must be exactly `message_size()` bytes
    ///
    /// # Returns
    ///
    /// Ok() when the message was written, Err(Error::InvalidArgument) when the
    /// destination has the wrong size

    pub fn serialize(&self, to: &mut [u8]) -> Result<(), Error> {
        if to.len() != self.message_size() {
            return Err(Error::InvalidArgument(
                format!("message needs {} bytes, buffer has {}",
                        self.message_size(), to.len())));
        }

        if self.extents.is_empty() {
            return Ok(());
        }

        let mut pos = 0;
        to[pos .. pos + LEN_SIZE].copy_from_slice(&(self.extents.len() as u64).to_le_bytes());
        pos += LEN_SIZE;
        for extent in &self.extents {
            to[pos .. pos + LEN_SIZE].copy_from_slice(&(extent.len() as u64).to_le_bytes());
            pos += LEN_SIZE;
            to[pos .. pos + extent.len()].copy_from_slice(extent);
            pos += extent.len();
        }

        Ok(())
    }

    /// Serialize into a newly allocated vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.message_size()];
        /* Size always matches */
        let _ = self.serialize(&mut out);
        out
    }
}

/// Consumer for an inbound message
#[derive(Default, Clone, Debug)]
pub struct MessageReader {
    extents: Vec<Vec<u8>>,
    next:    usize,
}

impl MessageReader {

    /// Reader with no extents
    pub fn empty() -> Self {
        Self{extents: Vec::new(), next: 0}
    }

    /// Parse a serialized message. An empty buffer is an empty message.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }

        let count = read_len(bytes, 0)?;
        let mut pos = LEN_SIZE;
        let mut extents = Vec::new();
        for _ in 0 .. count {
            let len = read_len(bytes, pos)?;
            pos += LEN_SIZE;
            let end = pos.checked_add(len)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| Error::Malformed("extent exceeds message".into()))?;
            extents.push(bytes[pos .. end].to_vec());
            pos = end;
        }

        if pos != bytes.len() {
            return Err(Error::Malformed("trailing bytes after last extent".into()));
        }

        Ok(Self{extents: extents, next: 0})
    }

    /// Total number of extents in the message
    pub fn size(&self) -> usize {
        self.extents.len()
    }

    /// Number of extents not yet consumed
    pub fn remaining(&self) -> usize {
        self.extents.len() - self.next
    }

    pub fn has_next(&self) -> bool {
        self.next < self.extents.len()
    }

    /// Fail unless the message holds exactly `count` extents
    pub fn expect_size(&self, count: usize) -> Result<(), Error> {
        if self.extents.len() != count {
            return Err(Error::Malformed(
                format!("expected {} extents, got {}", count, self.extents.len())));
        }
        Ok(())
    }

    /// Fail unless the message holds at least `count` extents
    pub fn expect_at_least(&self, count: usize) -> Result<(), Error> {
        if self.extents.len() < count {
            return Err(Error::Malformed(
                format!("expected at least {} extents, got {}",
                        count, self.extents.len())));
        }
        Ok(())
    }

    /// Consume the next extent as a scalar
    pub fn next<T: Scalar>(&mut self) -> Result<T, Error> {
        let extent = self.next_extent()?;
        if extent.len() != T::SIZE {
            return Err(Error::Malformed(
                format!("scalar of {} bytes, extent has {}", T::SIZE, extent.len())));
        }
        Ok(T::decode(extent))
    }

    /// Consume the next extent as raw bytes
    pub fn next_extent(&mut self) -> Result<&[u8], Error> {
        if self.next >= self.extents.len() {
            return Err(Error::Malformed("read past the last extent".into()));
        }

        self.next += 1;
        Ok(&self.extents[self.next - 1])
    }

    /// Consume the next extent as an owned byte vector
    pub fn next_bytes(&mut self) -> Result<Vec<u8>, Error> {
        Ok(self.next_extent()?.to_vec())
    }

    /// Consume the next extent as UTF-8 text
    pub fn next_string(&mut self) -> Result<String, Error> {
        let bytes = self.next_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| Error::Malformed("extent is not valid UTF-8".into()))
    }
}

impl From<MessageWriter> for MessageReader {
    fn from(writer: MessageWriter) -> Self {
        Self{extents: writer.extents, next: 0}
    }
}

fn read_len(bytes: &[u8], pos: usize) -> Result<usize, Error> {
    if bytes.len() < pos + LEN_SIZE {
        return Err(Error::Malformed("truncated length field".into()));
    }

    let len = u64::decode(&bytes[pos .. pos + LEN_SIZE]);
    usize::try_from(len).map_err(|_| Error::Malformed("length overflows".into()))
}
