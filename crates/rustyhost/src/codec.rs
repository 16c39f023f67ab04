//! Bounded cursor reader and little-endian frame writer
//!
//! Every protocol engine parses inbound frames through [`PduReader`], which
//! never reads past the end of the frame and reports a deterministic
//! [`CodecError::ShortRead`] instead.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

/// Framing errors raised while decoding a PDU
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("short read: needed {needed} bytes, {remaining} remaining")]
    ShortRead { needed: usize, remaining: usize },

    #[error("frame of {len} bytes exceeds limit {limit}")]
    Oversize { len: usize, limit: usize },

    #[error("invalid value {value:#04x} for {field}")]
    InvalidValue { field: &'static str, value: u8 },
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Cursor over an inbound frame
pub struct PduReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> PduReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.cursor.position() as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn ensure(&self, needed: usize) -> CodecResult<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(CodecError::ShortRead { needed, remaining });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        self.ensure(1)?;
        self.cursor
            .read_u8()
            .map_err(|_| CodecError::ShortRead { needed: 1, remaining: 0 })
    }

    pub fn read_u16(&mut self) -> CodecResult<u16> {
        self.ensure(2)?;
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| CodecError::ShortRead { needed: 2, remaining: 0 })
    }

    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.ensure(4)?;
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| CodecError::ShortRead { needed: 4, remaining: 0 })
    }

    pub fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.cursor
            .read_exact(&mut out)
            .map_err(|_| CodecError::ShortRead { needed: N, remaining: 0 })?;
        Ok(out)
    }

    /// Borrow the next `n` bytes of the frame
    pub fn read_slice(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        self.ensure(n)?;
        let start = self.position();
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + n) as u64);
        Ok(&data[start..start + n])
    }

    /// Borrow everything that is left
    pub fn rest(&mut self) -> &'a [u8] {
        let start = self.position();
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position(data.len() as u64);
        &data[start..]
    }
}

/// Little-endian frame builder
#[derive(Debug, Default, Clone)]
pub struct PduWriter {
    buf: Vec<u8>,
}

impl PduWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_opcode(opcode: u8) -> Self {
        Self { buf: vec![opcode] }
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
