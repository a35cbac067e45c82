// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Storage abstraction for sequential binary data reading and writing.
//!
//! Provides the [`Stream`] trait for reading binary data sequentially, and
//! [`ByteCursor`], a fixed-capacity buffer with an explicit offset that both
//! implements [`Stream`] and serves as the exact-size output buffer of the
//! encoders.

use core::fmt;

use crate::leb128::{self, Leb128};

/// Storage abstraction for the streamed reading of a WASM module.
pub trait Stream {
    /// Error type for storage-specific failures.
    type Error: fmt::Debug;

    /// Whether the given error signifies a failure to read due to having
    /// reached the end of the stream (i.e., the "End Of the File").
    fn is_eof(err: &Self::Error) -> bool;

    /// Returns the current byte offset into the stream.
    fn offset(&mut self) -> usize;

    /// Reads a single byte from the stream.
    fn read_byte(&mut self) -> Result<u8, Self::Error>;

    /// Reads exactly `buf.len()` bytes into the provided buffer.
    ///
    /// Returns an error if EOF is reached or an I/O error occurs
    /// before the buffer is completely filled.
    ///
    /// Implementors should override for better performance.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        for byte in buf {
            *byte = self.read_byte()?;
        }
        Ok(())
    }

    /// Skip the specified number of bytes in the stream.
    ///
    /// Implementors should override for better performance.
    fn skip_bytes(&mut self, count: usize) -> Result<(), Self::Error> {
        for _ in 0..count {
            self.read_byte()?;
        }
        Ok(())
    }
}

/// Represents attempting to read past the end of a buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryEof {}

/// Errors from the typed accessors of [`ByteCursor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorError {
    /// An access of `len` bytes at `offset` does not fit in the buffer.
    OutOfRange { offset: usize, len: usize },
    /// A LEB128 value is malformed or too large for its type.
    InvalidLeb128,
    /// A byte run is not valid UTF-8.
    InvalidUtf8,
}

impl leb128::Error for CursorError {
    fn invalid_leb128() -> Self {
        CursorError::InvalidLeb128
    }
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorError::OutOfRange { offset, len } => {
                write!(f, "access of {len:#x} bytes at {offset:#x} is out of range")
            }
            CursorError::InvalidLeb128 => write!(f, "invalid LEB128-encoding"),
            CursorError::InvalidUtf8 => write!(f, "invalid UTF-8"),
        }
    }
}

/// A byte buffer with an explicit read/write offset.
///
/// Reads and writes advance the offset by the width of what was accessed and
/// fail if too few bytes remain. The buffer never grows: writers are expected
/// to size it exactly up front.
#[derive(Clone, Debug)]
pub struct ByteCursor<Bytes> {
    bytes: Bytes,
    pos: usize,
}

impl<Bytes: AsRef<[u8]>> ByteCursor<Bytes> {
    /// Creates a cursor at offset zero.
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes, pos: 0 }
    }

    /// The current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves the offset, which may be at most the buffer's length.
    pub fn set_position(&mut self, pos: usize) -> Result<(), CursorError> {
        if pos > self.capacity() {
            return Err(CursorError::OutOfRange {
                offset: pos,
                len: 0,
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// The total size of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.bytes.as_ref().len()
    }

    /// The number of bytes between the offset and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.pos
    }

    /// Returns the underlying buffer.
    pub fn into_inner(self) -> Bytes {
        self.bytes
    }

    fn take(&mut self, len: usize) -> Result<&[u8], CursorError> {
        if len > self.remaining() {
            return Err(CursorError::OutOfRange {
                offset: self.pos,
                len,
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes.as_ref()[start..self.pos])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CursorError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CursorError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, CursorError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CursorError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, CursorError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Reads a LEB128 value of type `T` (signedness follows `T`).
    pub fn read_leb128<T: Leb128>(&mut self) -> Result<T, CursorError> {
        leb128::read(|| self.read_u8())
    }

    /// Reads `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], CursorError> {
        self.take(len)
    }

    /// Reads `len` bytes (not characters) of UTF-8.
    pub fn read_utf8(&mut self, len: usize) -> Result<&str, CursorError> {
        core::str::from_utf8(self.take(len)?).map_err(|_| CursorError::InvalidUtf8)
    }
}

impl<Bytes: AsRef<[u8]> + AsMut<[u8]>> ByteCursor<Bytes> {
    fn put(&mut self, data: &[u8]) -> Result<(), CursorError> {
        if data.len() > self.remaining() {
            return Err(CursorError::OutOfRange {
                offset: self.pos,
                len: data.len(),
            });
        }
        let start = self.pos;
        self.pos += data.len();
        self.bytes.as_mut()[start..self.pos].copy_from_slice(data);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), CursorError> {
        self.put(&[value])
    }

    pub fn write_u32_le(&mut self, value: u32) -> Result<(), CursorError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u64_le(&mut self, value: u64) -> Result<(), CursorError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<(), CursorError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), CursorError> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), CursorError> {
        self.put(data)
    }

    /// Writes `value` as unsigned LEB128, padded to at least `min_len` bytes.
    /// Returns the number of bytes written.
    pub fn write_uleb128(&mut self, value: u64, min_len: usize) -> Result<usize, CursorError> {
        leb128::write_unsigned(value, min_len, |byte| self.write_u8(byte))
    }

    /// Writes `value` as signed LEB128, padded to at least `min_len` bytes.
    /// Returns the number of bytes written.
    pub fn write_sleb128(&mut self, value: i64, min_len: usize) -> Result<usize, CursorError> {
        leb128::write_signed(value, min_len, |byte| self.write_u8(byte))
    }

    /// Writes the UTF-8 bytes of `value`. Returns the number of bytes written.
    pub fn write_utf8(&mut self, value: &str) -> Result<usize, CursorError> {
        self.put(value.as_bytes())?;
        Ok(value.len())
    }
}

impl<Bytes: AsRef<[u8]>> Stream for ByteCursor<Bytes> {
    type Error = MemoryEof;

    fn is_eof(_: &Self::Error) -> bool {
        true
    }

    fn offset(&mut self) -> usize {
        self.pos
    }

    fn read_byte(&mut self) -> Result<u8, Self::Error> {
        self.read_u8().map_err(|_| MemoryEof {})
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Self::Error> {
        let src = self.take(buf.len()).map_err(|_| MemoryEof {})?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn skip_bytes(&mut self, count: usize) -> Result<(), Self::Error> {
        self.take(count).map(|_| ()).map_err(|_| MemoryEof {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_round_trip() {
        let mut cursor = ByteCursor::new([0u8; 25]);
        cursor.write_u8(0xab).unwrap();
        cursor.write_u32_le(0xdead_beef).unwrap();
        cursor.write_u64_le(u64::MAX - 1).unwrap();
        cursor.write_f32(1.5).unwrap();
        cursor.write_f64(-0.25).unwrap();
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(
            cursor.write_u8(0),
            Err(CursorError::OutOfRange { offset: 25, len: 1 })
        );

        cursor.set_position(0).unwrap();
        assert_eq!(cursor.read_u8(), Ok(0xab));
        assert_eq!(cursor.read_u32_le(), Ok(0xdead_beef));
        assert_eq!(cursor.read_u64_le(), Ok(u64::MAX - 1));
        assert_eq!(cursor.read_f32(), Ok(1.5));
        assert_eq!(cursor.read_f64(), Ok(-0.25));
        assert!(cursor.read_u8().is_err());
    }

    #[test]
    fn leb128_round_trip_with_padding() {
        let mut cursor = ByteCursor::new([0u8; 16]);
        assert_eq!(cursor.write_uleb128(300, 0), Ok(2));
        assert_eq!(cursor.write_uleb128(7, 5), Ok(5));
        assert_eq!(cursor.write_sleb128(-2, 0), Ok(1));
        assert_eq!(cursor.write_sleb128(1 << 40, 0), Ok(leb128::signed_len(1 << 40)));
        let written = cursor.position();

        cursor.set_position(0).unwrap();
        assert_eq!(cursor.read_leb128::<u32>(), Ok(300));
        assert_eq!(cursor.read_leb128::<u32>(), Ok(7));
        assert_eq!(cursor.read_leb128::<i32>(), Ok(-2));
        assert_eq!(cursor.read_leb128::<i64>(), Ok(1 << 40));
        assert_eq!(cursor.position(), written);
    }

    #[test]
    fn utf8_lengths_count_bytes() {
        // One astral-plane character is a single `char` but four bytes.
        let name = "a\u{1F600}b";
        assert_eq!(name.chars().count(), 3);

        let mut cursor = ByteCursor::new([0u8; 6]);
        assert_eq!(cursor.write_utf8(name), Ok(6));
        cursor.set_position(0).unwrap();
        assert_eq!(cursor.read_utf8(6), Ok(name));

        let mut cursor = ByteCursor::new([0xff, 0xfe]);
        assert_eq!(cursor.read_utf8(2), Err(CursorError::InvalidUtf8));
    }

    #[test]
    fn stream_reads_stop_at_end() {
        let mut cursor = ByteCursor::new(&[1u8, 2, 3][..]);
        let mut buf = [0u8; 2];
        cursor.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert_eq!(Stream::offset(&mut cursor), 2);
        assert!(cursor.skip_bytes(2).is_err());
        assert_eq!(cursor.read_byte(), Ok(3));
        assert_eq!(cursor.read_byte(), Err(MemoryEof {}));
    }
}
