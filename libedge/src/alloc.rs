//! Ownership of memory that crosses the boundary
//!
//! Boundary buffers live on the untrusted heap. A `HostBuffer` owns one such
//! allocation and frees it exactly once when dropped. Ownership moves across
//! a crossing through `BoundaryParams`: the caller places its argument buffer
//! in `input`, the callee takes it (and frees it), and the callee places a
//! newly allocated result in `output` for the caller to take.
//
// SPDX-License-Identifier: MIT
// Copyright (C) 2022 VTT Technical Research Centre of Finland Ltd

use core::ffi::c_void;
use core::ptr::NonNull;

use crate::Error;
use crate::message::{MessageReader, MessageWriter};

/// Untrusted heap allocation with a single owner
#[derive(Debug)]
pub struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The buffer is plain bytes owned by exactly one HostBuffer
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {

    /// Allocate a zeroed buffer of `len` bytes
    ///
    /// # Inputs
    /// * 'len' is the buffer size in bytes, must be non-zero
    ///
    /// # Returns
    ///
    /// The buffer, Err(Error::InvalidArgument) for a zero length or
    /// Err(Error::OutOfMemory) when the allocation fails

    pub fn alloc(len: usize) -> Result<Self, Error> {
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length boundary buffer".into()));
        }

        let raw = unsafe { libc::calloc(1, len) } as *mut u8;
        match NonNull::new(raw) {
            Some(ptr) => Ok(Self{ptr: ptr, len: len}),
            None      => Err(Error::OutOfMemory),
        }
    }

    /// Allocate a buffer holding a copy of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let mut buffer = Self::alloc(bytes.len())?;
        buffer.as_mut_slice().copy_from_slice(bytes);
        Ok(buffer)
    }

    /// Allocate a buffer holding a serialized message
    pub fn from_message(writer: &MessageWriter) -> Result<Self, Error> {
        let mut buffer = Self::alloc(writer.message_size())?;
        writer.serialize(buffer.as_mut_slice())?;
        Ok(buffer)
    }

    /// Take ownership of memory obtained from `into_raw`
    ///
    /// # Safety
    ///
    /// `ptr` must come from `HostBuffer::into_raw` with the same `len` (in
    /// this process) and must not be owned by any other HostBuffer.

    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Result<Self, Error> {
        match NonNull::new(ptr) {
            Some(ptr) if len > 0 => Ok(Self{ptr: ptr, len: len}),
            _ => Err(Error::InvalidArgument("null or empty boundary buffer".into())),
        }
    }

    /// Release ownership without freeing. The receiver must call `from_raw`.
    pub fn into_raw(self) -> (*mut u8, usize) {
        let raw = (self.ptr.as_ptr(), self.len);
        core::mem::forget(self);
        raw
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.as_ptr() as *mut c_void) };
    }
}

/// Buffers moved through one boundary crossing
#[derive(Debug, Default)]
pub struct BoundaryParams {
    /// Serialized arguments; allocated by the caller, taken by the callee
    pub input:  Option<HostBuffer>,
    /// Serialized results; allocated by the callee, taken by the caller
    pub output: Option<HostBuffer>,
}

impl BoundaryParams {

    /// Parameters carrying `writer` as input. An empty message has no buffer.
    pub fn from_writer(writer: &MessageWriter) -> Result<Self, Error> {
        let input = if writer.message_size() == 0 {
            None
        } else {
            Some(HostBuffer::from_message(writer)?)
        };

        Ok(Self{input: input, output: None})
    }

    /// Callee side: take and free the input, returning its decoded form
    pub fn take_input(&mut self) -> Result<MessageReader, Error> {
        match self.input.take() {
            Some(buffer) => MessageReader::deserialize(buffer.as_slice()),
            None         => Ok(MessageReader::empty()),
        }
    }

    /// Callee side: allocate the output for `writer`, nothing for no results
    pub fn set_output(&mut self, writer: &MessageWriter) -> Result<(), Error> {
        self.output = if writer.message_size() == 0 {
            None
        } else {
            Some(HostBuffer::from_message(writer)?)
        };
        Ok(())
    }

    /// Caller side: take and free the output, returning its decoded form
    pub fn take_output(&mut self) -> Result<MessageReader, Error> {
        match self.output.take() {
            Some(buffer) => MessageReader::deserialize(buffer.as_slice()),
            None         => Ok(MessageReader::empty()),
        }
    }
}
