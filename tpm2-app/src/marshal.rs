// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 wire codec
//!
//! Big-endian integers and `TPM2B` (u16 length-prefixed) buffers. Builders
//! never fail; a sized field that exceeds its protocol maximum is a caller
//! bug and panics. Parsers return errors so that the orchestrator can decide
//! how to treat a malformed engine response.

use anyhow::{bail, Result};

/// Panic unless `len` fits in a sized field of capacity `max`.
#[track_caller]
pub fn check_size(field: &str, len: usize, max: usize) {
    assert!(
        len <= max,
        "{field} is {len} bytes, exceeds the {max}-byte limit"
    );
}

/// Buffer for building TPM commands
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    #[track_caller]
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        check_size("TPM2B payload", data.len(), u16::MAX as usize);
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    /// Put an empty TPM2B structure
    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    /// Put a structure wrapped in a u16 size prefix, e.g. TPM2B_PUBLIC.
    #[track_caller]
    pub fn put_sized(&mut self, write: impl FnOnce(&mut CommandBuffer)) {
        let mut inner = CommandBuffer::new();
        write(&mut inner);
        self.put_tpm2b(inner.as_bytes());
    }

    /// Like [`put_sized`](Self::put_sized) with a u32 size, as used by the
    /// command authorization area.
    pub fn put_sized32(&mut self, write: impl FnOnce(&mut CommandBuffer)) {
        let mut inner = CommandBuffer::new();
        write(&mut inner);
        self.put_u32(inner.len() as u32);
        self.put_bytes(inner.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Update a u32 at a specific position (for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Buffer for parsing TPM responses
#[derive(Debug, Clone)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let Some(bytes) = self.data.get(self.pos..self.pos + N) else {
            bail!("buffer underflow reading {what}");
        };
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos += N;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(u8::from_be_bytes(self.take("u8")?))
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take("u16")?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take("u32")?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take("u64")?))
    }

    /// Borrow the next `len` bytes
    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            bail!(
                "buffer underflow reading {} bytes (remaining: {})",
                len,
                self.remaining()
            );
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.get_slice(len).map(<[u8]>::to_vec)
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get a TPM2B and check it against its protocol maximum
    pub fn get_tpm2b_bounded(&mut self, max: usize) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        if size > max {
            bail!("TPM2B size {size} exceeds limit {max}");
        }
        self.get_bytes(size)
    }

    /// Split off the next `len` bytes as an independent reader
    pub fn sub_buffer(&mut self, len: usize) -> Result<ResponseBuffer<'a>> {
        Ok(ResponseBuffer::new(self.get_slice(len)?))
    }

    /// Split off a size-prefixed structure, e.g. TPM2B_PUBLIC
    pub fn get_sized(&mut self) -> Result<ResponseBuffer<'a>> {
        let size = self.get_u16()? as usize;
        self.sub_buffer(size)
    }

    /// Get remaining bytes
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    /// Skip bytes
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.get_slice(len).map(|_| ())
    }

    /// Peek at bytes without advancing position
    pub fn peek_bytes(&self, len: usize) -> Result<&'a [u8]> {
        match self.data.get(self.pos..self.pos + len) {
            Some(bytes) => Ok(bytes),
            None => bail!("buffer underflow peeking {} bytes", len),
        }
    }

    /// Fail unless every byte has been consumed
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            bail!("{} trailing bytes after structure", self.remaining());
        }
        Ok(())
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        Self::unmarshal(&mut buf)
    }
}

macro_rules! impl_int_codec {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, buf: &mut CommandBuffer) {
                    buf.$put(*self);
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                    buf.$get()
                }
            }
        )*
    };
}

impl_int_codec! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
}
