// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Byte sinks for the encoder.
//!
//! Every encoding routine is written once, against [`Sink`]. Running it
//! against [`Measure`] computes the exact encoded length; running it against a
//! [`ByteCursor`] over a buffer of that length writes the bytes.

use crate::leb128;
use crate::storage::ByteCursor;

use super::Error;

pub(crate) trait Sink {
    fn put_byte(&mut self, byte: u8) -> Result<(), Error>;

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// The number of bytes put so far.
    fn written(&self) -> usize;

    fn put_uleb(&mut self, value: u64, min_len: usize) -> Result<(), Error> {
        leb128::write_unsigned(value, min_len, |byte| self.put_byte(byte)).map(|_| ())
    }

    fn put_sleb(&mut self, value: i64) -> Result<(), Error> {
        leb128::write_signed(value, 0, |byte| self.put_byte(byte)).map(|_| ())
    }

    fn put_u32(&mut self, value: u32) -> Result<(), Error> {
        self.put_uleb(u64::from(value), 0)
    }

    // Counts are bounded by what was decoded or allocated, which is far below
    // 2^32 in practice.
    fn put_len(&mut self, len: usize) -> Result<(), Error> {
        self.put_uleb(len as u64, 0)
    }

    fn put_name(&mut self, name: &str) -> Result<(), Error> {
        self.put_len(name.len())?;
        self.put_bytes(name.as_bytes())
    }
}

/// A sink that only counts.
#[derive(Debug, Default)]
pub(crate) struct Measure {
    len: usize,
}

impl Sink for Measure {
    fn put_byte(&mut self, _: u8) -> Result<(), Error> {
        self.len += 1;
        Ok(())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.len += bytes.len();
        Ok(())
    }

    fn written(&self) -> usize {
        self.len
    }

    fn put_uleb(&mut self, value: u64, min_len: usize) -> Result<(), Error> {
        self.len += leb128::padded_len(leb128::unsigned_len(value), min_len);
        Ok(())
    }

    fn put_sleb(&mut self, value: i64) -> Result<(), Error> {
        self.len += leb128::signed_len(value);
        Ok(())
    }
}

impl<Bytes: AsRef<[u8]> + AsMut<[u8]>> Sink for ByteCursor<Bytes> {
    fn put_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.write_u8(byte).map_err(|_| Error::BufferOverflow)
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write_bytes(bytes).map_err(|_| Error::BufferOverflow)
    }

    fn written(&self) -> usize {
        self.position()
    }
}
