// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! LEB128 reading, writing and length computation.
//!
//! The length functions never allocate or write; the two-pass encoders sum
//! them to size a buffer exactly before writing into it with [`write_unsigned`]
//! and [`write_signed`]. Both writers accept a minimum byte count, used to keep
//! relocatable fields at a fixed width: the value is padded with
//! continuation-marked bytes and terminated by a zero (or sign) byte.

use core::ops;

/// The maximum length of a LEB128-encoded 32-bit integer.
pub const MAX_LEN_32: usize = 5;

/// The maximum length of a LEB128-encoded 64-bit integer.
pub const MAX_LEN_64: usize = 10;

const CONTENT_MASK: u8 = 0x7f;
const CONTINUATION_BIT: u8 = 0x80;
const SIGN_BIT: u8 = 0x40;

/// A LEB128-decodable integral type.
pub trait Leb128:
    From<u8>                       //
    + ops::BitOrAssign             //
    + ops::Not<Output = Self>      //
    + ops::Shl<u32, Output = Self> //
{
    const MAX_BITS: u32;
    const IS_SIGNED: bool;
}

impl Leb128 for u32 {
    const MAX_BITS: u32 = 32;
    const IS_SIGNED: bool = false;
}

impl Leb128 for u64 {
    const MAX_BITS: u32 = 64;
    const IS_SIGNED: bool = false;
}

impl Leb128 for i32 {
    const MAX_BITS: u32 = 32;
    const IS_SIGNED: bool = true;
}

impl Leb128 for i64 {
    const MAX_BITS: u32 = 64;
    const IS_SIGNED: bool = true;
}

/// Error trait for LEB128 parsing failures.
pub trait Error {
    fn invalid_leb128() -> Self;
}

/// Reads a LEB128-encoded value using the provided byte source function.
///
/// Non-minimal encodings are accepted; encodings longer than the type allows,
/// or whose final byte carries bits that do not fit, are rejected.
pub fn read<T, F, E>(mut read_byte: F) -> Result<T, E>
where
    T: Leb128,
    F: FnMut() -> Result<u8, E>,
    E: Error,
{
    let mut result = T::from(0);
    let mut shift = 0;
    let mut byte;

    loop {
        if shift >= T::MAX_BITS {
            return Err(E::invalid_leb128());
        }

        byte = read_byte()?;
        let content = byte & CONTENT_MASK;

        // Validate that the final byte doesn't overflow the remaining bits.
        if T::MAX_BITS - shift < 7 {
            let remaining_bits = T::MAX_BITS - shift;
            let valid = if T::IS_SIGNED {
                // For signed types, the unused bits must be consistent with the
                // sign bit.
                let mask = ((!0u8) << (remaining_bits - 1)) & CONTENT_MASK;
                let masked = content & mask;
                masked == 0 || masked == mask
            } else {
                // For unsigned types, the unused bits must be zero.
                content < (1u8 << remaining_bits)
            };
            if !valid {
                return Err(E::invalid_leb128());
            }
        }

        result |= T::from(content) << shift;
        shift += 7;

        if byte & CONTINUATION_BIT == 0 {
            break;
        }
    }

    if T::IS_SIGNED && shift < T::MAX_BITS && (byte & SIGN_BIT) != 0 {
        result |= !T::from(0) << shift;
    }
    Ok(result)
}

/// The number of bytes the unsigned LEB128 encoding of `value` occupies.
pub const fn unsigned_len(value: u64) -> usize {
    let bits = u64::BITS - value.leading_zeros();
    if bits == 0 { 1 } else { bits.div_ceil(7) as usize }
}

/// The number of bytes the signed LEB128 encoding of `value` occupies.
pub const fn signed_len(value: i64) -> usize {
    // Magnitude bits plus one for the sign.
    let magnitude = if value < 0 { !value } else { value };
    let bits = u64::BITS - (magnitude as u64).leading_zeros() + 1;
    bits.div_ceil(7) as usize
}

/// The length of an encoding padded out to at least `min_len` bytes.
pub const fn padded_len(len: usize, min_len: usize) -> usize {
    if len < min_len { min_len } else { len }
}

/// Writes the unsigned LEB128 encoding of `value` through `put`, padded to at
/// least `min_len` bytes. Returns the number of bytes written.
pub fn write_unsigned<F, E>(mut value: u64, min_len: usize, mut put: F) -> Result<usize, E>
where
    F: FnMut(u8) -> Result<(), E>,
{
    let mut len = 0;
    loop {
        let byte = (value as u8) & CONTENT_MASK;
        value >>= 7;
        len += 1;
        let done = value == 0;
        if done && len >= min_len {
            put(byte)?;
            return Ok(len);
        }
        put(byte | CONTINUATION_BIT)?;
        if done {
            break;
        }
    }
    pad(len, min_len, 0, put)
}

/// Writes the signed LEB128 encoding of `value` through `put`, padded to at
/// least `min_len` bytes. Returns the number of bytes written.
pub fn write_signed<F, E>(mut value: i64, min_len: usize, mut put: F) -> Result<usize, E>
where
    F: FnMut(u8) -> Result<(), E>,
{
    let mut len = 0;
    loop {
        let byte = (value as u8) & CONTENT_MASK;
        value >>= 7;
        len += 1;
        let done = (value == 0 && byte & SIGN_BIT == 0) || (value == -1 && byte & SIGN_BIT != 0);
        if done && len >= min_len {
            put(byte)?;
            return Ok(len);
        }
        put(byte | CONTINUATION_BIT)?;
        if done {
            break;
        }
    }
    let fill = if value < 0 { CONTENT_MASK } else { 0 };
    pad(len, min_len, fill, put)
}

// Emits padding after a value whose last byte was already marked as
// continued: continuation-marked `fill` bytes, then a terminal `fill` byte.
fn pad<F, E>(mut len: usize, min_len: usize, fill: u8, mut put: F) -> Result<usize, E>
where
    F: FnMut(u8) -> Result<(), E>,
{
    debug_assert!(len < min_len);
    while len + 1 < min_len {
        put(fill | CONTINUATION_BIT)?;
        len += 1;
    }
    put(fill)?;
    Ok(len + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        InvalidLeb128,
        Eof,
    }

    impl Error for TestError {
        fn invalid_leb128() -> Self {
            TestError::InvalidLeb128
        }
    }

    fn byte_reader(bytes: &[u8]) -> impl FnMut() -> Result<u8, TestError> + '_ {
        let mut index = 0;
        move || {
            if index >= bytes.len() {
                return Err(TestError::Eof);
            }
            let byte = bytes[index];
            index += 1;
            Ok(byte)
        }
    }

    fn read_u32(bytes: &[u8]) -> Result<u32, TestError> {
        read::<u32, _, _>(byte_reader(bytes))
    }

    fn read_u64(bytes: &[u8]) -> Result<u64, TestError> {
        read::<u64, _, _>(byte_reader(bytes))
    }

    fn read_i32(bytes: &[u8]) -> Result<i32, TestError> {
        read::<i32, _, _>(byte_reader(bytes))
    }

    fn read_i64(bytes: &[u8]) -> Result<i64, TestError> {
        read::<i64, _, _>(byte_reader(bytes))
    }

    fn unsigned_bytes(value: u64, min_len: usize) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        let written = write_unsigned(value, min_len, |b| {
            out.push(b);
            Ok::<_, ()>(())
        })
        .unwrap();
        assert_eq!(written, out.len());
        out
    }

    fn signed_bytes(value: i64, min_len: usize) -> std::vec::Vec<u8> {
        let mut out = std::vec::Vec::new();
        let written = write_signed(value, min_len, |b| {
            out.push(b);
            Ok::<_, ()>(())
        })
        .unwrap();
        assert_eq!(written, out.len());
        out
    }

    const BOUNDARY_VALUES: [i64; 20] = [
        0,
        1,
        -1,
        63,
        64,
        -64,
        -65,
        127,
        128,
        255,
        256,
        16383,
        16384,
        i32::MAX as i64,
        i32::MIN as i64,
        u32::MAX as i64,
        1 << 53,
        -(1 << 53),
        i64::MAX,
        i64::MIN,
    ];

    #[test]
    fn u32_basic_values() {
        assert_eq!(read_u32(&[0x00]), Ok(0));
        assert_eq!(read_u32(&[0x7f]), Ok(127));
        assert_eq!(read_u32(&[0x80, 0x01]), Ok(0x80));
        assert_eq!(read_u32(&[0x80, 0x80, 0x04]), Ok(0x10000));
        assert_eq!(read_u32(&[0xff, 0xff, 0xff, 0xff, 0x0f]), Ok(u32::MAX));
    }

    #[test]
    fn u32_too_long_or_too_large() {
        assert_eq!(
            read_u32(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]),
            Err(TestError::InvalidLeb128)
        );
        assert_eq!(
            read_u32(&[0xff, 0xff, 0xff, 0xff, 0x1f]),
            Err(TestError::InvalidLeb128)
        );
        assert_eq!(read_u32(&[0x80, 0x80]), Err(TestError::Eof));
    }

    #[test]
    fn u64_beyond_32_bits() {
        assert_eq!(read_u64(&[0x80, 0x80, 0x80, 0x80, 0x10]), Ok(1 << 32));
        assert_eq!(
            read_u64(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]),
            Ok(u64::MAX)
        );
    }

    #[test]
    fn signed_sign_extension() {
        assert_eq!(read_i32(&[0x7f]), Ok(-1));
        assert_eq!(read_i32(&[0x80, 0x7f]), Ok(-128));
        assert_eq!(read_i32(&[0x80, 0x80, 0x80, 0x80, 0x78]), Ok(i32::MIN));
        assert_eq!(read_i32(&[0xff, 0xff, 0xff, 0xff, 0x07]), Ok(i32::MAX));
        assert_eq!(
            read_i32(&[0xff, 0xff, 0xff, 0xff, 0x4f]),
            Err(TestError::InvalidLeb128)
        );
        assert_eq!(
            read_i64(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7f]),
            Ok(i64::MIN)
        );
    }

    #[test]
    fn canonical_writes() {
        assert_eq!(unsigned_bytes(0, 0), [0x00]);
        assert_eq!(unsigned_bytes(624_485, 0), [0xe5, 0x8e, 0x26]);
        assert_eq!(signed_bytes(-123_456, 0), [0xc0, 0xbb, 0x78]);
        assert_eq!(signed_bytes(-64, 0), [0x40]);
        assert_eq!(signed_bytes(64, 0), [0xc0, 0x00]);
    }

    #[test]
    fn padded_writes() {
        assert_eq!(unsigned_bytes(5, 5), [0x85, 0x80, 0x80, 0x80, 0x00]);
        assert_eq!(unsigned_bytes(0, 2), [0x80, 0x00]);
        assert_eq!(signed_bytes(-1, 3), [0xff, 0xff, 0x7f]);
        assert_eq!(signed_bytes(2, 3), [0x82, 0x80, 0x00]);
        // Padding never truncates.
        assert_eq!(unsigned_bytes(624_485, 1), [0xe5, 0x8e, 0x26]);

        assert_eq!(read_u32(&unsigned_bytes(5, 5)), Ok(5));
        assert_eq!(read_i32(&signed_bytes(-1, 3)), Ok(-1));
    }

    #[test]
    fn lengths_match_writes_at_boundaries() {
        for value in BOUNDARY_VALUES {
            let bytes = signed_bytes(value, 0);
            assert_eq!(signed_len(value), bytes.len(), "signed {value}");
            assert_eq!(read_i64(&bytes), Ok(value));

            let unsigned = value as u64;
            let bytes = unsigned_bytes(unsigned, 0);
            assert_eq!(unsigned_len(unsigned), bytes.len(), "unsigned {unsigned}");
            assert_eq!(read_u64(&bytes), Ok(unsigned));
        }
    }

    proptest! {
        #[test]
        fn unsigned_inverse_law(value: u64, min_len in 0usize..=MAX_LEN_64) {
            let bytes = unsigned_bytes(value, min_len);
            prop_assert_eq!(bytes.len(), padded_len(unsigned_len(value), min_len));
            prop_assert_eq!(read_u64(&bytes), Ok(value));
        }

        #[test]
        fn signed_inverse_law(value: i64, min_len in 0usize..=MAX_LEN_64) {
            let bytes = signed_bytes(value, min_len);
            prop_assert_eq!(bytes.len(), padded_len(signed_len(value), min_len));
            prop_assert_eq!(read_i64(&bytes), Ok(value));
        }

        #[test]
        fn u32_and_i32_round_trip(unsigned: u32, signed: i32) {
            prop_assert_eq!(read_u32(&unsigned_bytes(u64::from(unsigned), 0)), Ok(unsigned));
            prop_assert_eq!(read_i32(&signed_bytes(i64::from(signed), 0)), Ok(signed));
        }
    }
}
