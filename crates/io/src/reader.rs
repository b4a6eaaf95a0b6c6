//! Bounds-checked reader over an in-memory byte span.

use crate::error::{IoError, IoResult};

/// Maximum number of bytes a single var-int may occupy.
const MAX_VAR_INT_BYTES: usize = 10;

/// A reader that decodes values written by
/// [`BinaryWriter`](crate::BinaryWriter). Every read is bounds-checked;
/// running off the end returns [`IoError::EndOfStream`].
pub struct MemoryReader<'a> {
    span: &'a [u8],
    pos: usize,
}

impl<'a> MemoryReader<'a> {
    /// Creates a reader over the given span.
    pub fn new(span: &'a [u8]) -> Self {
        Self { span, pos: 0 }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Total span length.
    pub fn len(&self) -> usize {
        self.span.len()
    }

    /// True when the span is empty.
    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    /// Bytes remaining after the current position.
    pub fn remaining(&self) -> usize {
        self.span.len() - self.pos
    }

    /// Moves the read position.
    pub fn set_position(&mut self, position: usize) -> IoResult<()> {
        if position > self.span.len() {
            return Err(IoError::OutOfBounds {
                position,
                length: self.span.len(),
            });
        }
        self.pos = position;
        Ok(())
    }

    fn take(&mut self, count: usize, context: &str) -> IoResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(IoError::end_of_stream(count - self.remaining(), context));
        }
        let slice = &self.span[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> IoResult<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Reads a boolean; anything other than 0 or 1 is invalid data.
    pub fn read_bool(&mut self) -> IoResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(IoError::invalid_data("bool", format!("byte {other:#04x}"))),
        }
    }

    /// Reads a 16-bit unsigned integer.
    pub fn read_u16(&mut self) -> IoResult<u16> {
        let bytes = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a 32-bit unsigned integer.
    pub fn read_u32(&mut self) -> IoResult<u32> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a 64-bit unsigned integer.
    pub fn read_u64(&mut self) -> IoResult<u64> {
        let bytes = self.take(8, "u64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a 32-bit signed integer.
    pub fn read_i32(&mut self) -> IoResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Reads a 64-bit signed integer.
    pub fn read_i64(&mut self) -> IoResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Reads a 32-bit float.
    pub fn read_f32(&mut self) -> IoResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Reads a 64-bit float.
    pub fn read_f64(&mut self) -> IoResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads an unsigned LEB128 var-int.
    pub fn read_var_u64(&mut self) -> IoResult<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for _ in 0..MAX_VAR_INT_BYTES {
            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(IoError::invalid_data("var-int", "exceeds 10 bytes"))
    }

    /// Reads a var-int capped at `limit`; a larger value is a
    /// [`IoError::LimitExceeded`].
    pub fn read_var_u64_capped(&mut self, what: &str, limit: u64) -> IoResult<u64> {
        let value = self.read_var_u64()?;
        if value > limit {
            return Err(IoError::limit_exceeded(what, value, limit));
        }
        Ok(value)
    }

    /// Reads `count` raw bytes.
    pub fn read_raw(&mut self, count: usize) -> IoResult<&'a [u8]> {
        self.take(count, "raw bytes")
    }

    /// Reads a var-int length prefix followed by that many bytes.
    pub fn read_bytes(&mut self) -> IoResult<&'a [u8]> {
        let len = self.read_var_u64()? as usize;
        self.take(len, "length-prefixed bytes")
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> IoResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| IoError::invalid_data("string", e.to_string()))
    }

    /// Skips zero padding until the position is a multiple of `alignment`.
    pub fn align_to(&mut self, alignment: usize) -> IoResult<()> {
        if alignment > 1 {
            let rem = self.pos % alignment;
            if rem != 0 {
                self.take(alignment - rem, "alignment padding")?;
            }
        }
        Ok(())
    }
}
