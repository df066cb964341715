//! Utilities for decoding from and encoding into bytes.
//!
//! This module defines the zero-copy (de)serialization traits [`ToBytes`] and [`FromBytes`],
//! together with the cursor types [`ByteWriter`] and [`ByteReader`] they operate on. A cursor
//! wraps a caller-supplied buffer and advances over it; nothing here allocates.
//!
//! Everything transmitted over a transport or persisted in the key-value store implements
//! [`ToBytes`]/[`FromBytes`]: HAP-BLE PDU fragments, pairing records, UUIDs and characteristic
//! values. Integers are little-endian throughout, matching the HAP wire formats.
//!
//! [`ToBytes`]: trait.ToBytes.html
//! [`FromBytes`]: trait.FromBytes.html
//! [`ByteWriter`]: struct.ByteWriter.html
//! [`ByteReader`]: struct.ByteReader.html

use crate::Error;

/// Writes values into a borrowed byte buffer, front to back.
///
/// All `write_*` methods return `Error::Eof` when the remaining space cannot hold the value; in
/// that case nothing is written.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    /// Creates a writer that will write to `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter { buf, pos: 0 }
    }

    /// Returns the number of bytes that can be written to `self` until it is full.
    pub fn space_left(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Writes all bytes from `other` to `self`.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if self.space_left() < other.len() {
            return Err(Error::Eof);
        }
        self.buf[self.pos..self.pos + other.len()].copy_from_slice(other);
        self.pos += other.len();
        Ok(())
    }

    /// Writes a single byte to `self`.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.write_slice(&[byte])
    }

    /// Writes a `u16` to `self`, using Little Endian byte order.
    pub fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }

    /// Writes a `u32` to `self`, using Little Endian byte order.
    pub fn write_u32_le(&mut self, value: u32) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }

    /// Writes a `u64` to `self`, using Little Endian byte order.
    pub fn write_u64_le(&mut self, value: u64) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }
}

/// Reads values from a borrowed byte slice, front to back.
///
/// All `read_*` methods return `Error::Eof` when fewer bytes are left than the value needs; in
/// that case the cursor does not move.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader` that will read from the given byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader { buf: bytes, pos: 0 }
    }

    /// Returns the bytes that have not been read yet, without advancing the cursor.
    pub fn as_raw_bytes(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Returns the number of bytes that can still be read from `self`.
    pub fn bytes_left(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns whether `self` is at the end of the underlying buffer (EOF).
    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Skips the given number of bytes in the input data without inspecting them.
    pub fn skip(&mut self, bytes: usize) -> Result<(), Error> {
        if self.bytes_left() < bytes {
            return Err(Error::Eof);
        }
        self.pos += bytes;
        Ok(())
    }

    /// Reads a fixed-size byte array from `self`.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.bytes_left() < N {
            return Err(Error::Eof);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Reads the remaining bytes from `self`.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Reads a single byte from `self`.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a `u16` from `self`, using Little Endian byte order.
    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }
}

/// Trait for encoding a value into a byte buffer.
pub trait ToBytes {
    /// Converts `self` to bytes and writes them into `writer`, advancing `writer` to point past
    /// the encoded value.
    ///
    /// If `writer` does not contain enough space, an error will be returned and the state of the
    /// buffer is unspecified (eg. `self` may be partially written into `writer`).
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error>;
}

/// Trait for decoding values from a byte slice.
pub trait FromBytes<'a>: Sized {
    /// Decode a `Self` from a byte slice, advancing `bytes` to point past the data that was
    /// read.
    ///
    /// If `bytes` contains data not valid for the target type, or contains an insufficient
    /// number of bytes, an error will be returned and the state of `bytes` is unspecified (it
    /// can point to arbitrary data).
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_advances_and_fills() {
        let mut buf = [0; 8];
        let mut writer = ByteWriter::new(&mut buf);
        writer.write_u8(0xAB).unwrap();
        writer.write_u16_le(0x1234).unwrap();
        writer.write_u32_le(0x0A0B_0C0D).unwrap();
        assert_eq!(writer.space_left(), 1);
        assert_eq!(writer.write_u16_le(0), Err(Error::Eof));
        // A failed write leaves the cursor alone.
        assert_eq!(writer.space_left(), 1);
        writer.write_u8(0xFF).unwrap();
        assert_eq!(buf, [0xAB, 0x34, 0x12, 0x0D, 0x0C, 0x0B, 0x0A, 0xFF]);
    }

    #[test]
    fn reader_advances_and_stops() {
        let bytes = [0x01, 0x34, 0x12, 9, 9, 9];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u16_le().unwrap(), 0x1234);
        assert_eq!(reader.as_raw_bytes(), &[9, 9, 9]);
        assert_eq!(reader.bytes_left(), 3);
        assert_eq!(reader.skip(4), Err(Error::Eof));
        assert_eq!(reader.read_rest(), &[9, 9, 9]);
        assert!(reader.is_empty());
        assert_eq!(reader.read_u8(), Err(Error::Eof));
    }

    #[test]
    fn read_array_is_exact() {
        let bytes = [1, 2, 3];
        let mut reader = ByteReader::new(&bytes);
        let arr: [u8; 2] = reader.read_array().unwrap();
        assert_eq!(arr, [1, 2]);
        assert_eq!(reader.read_array::<2>(), Err(Error::Eof));
        assert_eq!(reader.bytes_left(), 1);
    }
}
