//! The type-length-value (TLV8) codec shared by pairing and characteristic signatures.
//!
//! Every record is `type:1, length:1, value[length]`. Logical values longer than 255 bytes are
//! carried as a chain: fragments of exactly 255 bytes, all with the same type, terminated by a
//! fragment shorter than 255 (possibly empty). Adjacent records of the same type are therefore
//! *always* one logical value; producers that need two separate same-type values must delimit
//! them with a zero-length separator record of a different type.
//!
//! [`TlvReader`] iterates logical values without copying; a chained value can be linearized into
//! caller-provided scratch with [`TlvValue::copy_into`]. [`TlvWriter`] appends logical values of
//! any length and hands out scratch space carved from the unwritten tail of its buffer, so that
//! intermediate data (eg. a sub-TLV that still has to be encrypted) never needs a second
//! allocation.
//!
//! [`TlvReader`]: struct.TlvReader.html
//! [`TlvWriter`]: struct.TlvWriter.html
//! [`TlvValue::copy_into`]: struct.TlvValue.html#method.copy_into

use crate::bytes::ByteReader;
use crate::Error;
use core::fmt;

/// Maximum value bytes in a single TLV record.
pub const MAX_FRAGMENT: usize = 255;

/// A logical TLV value, possibly spanning several chained records.
#[derive(Copy, Clone)]
pub struct TlvValue<'a> {
    /// The raw record span, including all fragment headers.
    raw: &'a [u8],
    /// Total value bytes across all fragments.
    len: usize,
}

impl<'a> TlvValue<'a> {
    /// Logical length of the value in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over the value fragments in order.
    pub fn fragments(&self) -> impl Iterator<Item = &'a [u8]> {
        let mut raw = self.raw;
        core::iter::from_fn(move || {
            if raw.len() < 2 {
                return None;
            }
            let len = usize::from(raw[1]);
            let frag = &raw[2..2 + len];
            raw = &raw[2 + len..];
            Some(frag)
        })
    }

    /// Returns the value as a single slice when it does not cross a fragment boundary.
    pub fn as_contiguous(&self) -> Option<&'a [u8]> {
        if self.len <= MAX_FRAGMENT {
            Some(&self.raw[2..2 + self.len])
        } else {
            None
        }
    }

    /// Linearizes the value into `out`, returning the written prefix.
    ///
    /// Returns `Error::Eof` when `out` is shorter than the value.
    pub fn copy_into<'b>(&self, out: &'b mut [u8]) -> Result<&'b [u8], Error> {
        if out.len() < self.len {
            return Err(Error::Eof);
        }
        let mut offset = 0;
        for frag in self.fragments() {
            out[offset..offset + frag.len()].copy_from_slice(frag);
            offset += frag.len();
        }
        Ok(&out[..self.len])
    }

    /// Decodes the value as a little-endian unsigned integer of 1 to 8 bytes.
    pub fn parse_uint_le(&self) -> Result<u64, Error> {
        let bytes = self.as_contiguous().ok_or(Error::InvalidLength)?;
        if bytes.is_empty() || bytes.len() > 8 {
            return Err(Error::InvalidLength);
        }
        let mut value = 0;
        for (i, b) in bytes.iter().enumerate() {
            value |= u64::from(*b) << (8 * i);
        }
        Ok(value)
    }

    /// Decodes a single-byte value.
    pub fn parse_u8(&self) -> Result<u8, Error> {
        match self.as_contiguous() {
            Some([b]) => Ok(*b),
            _ => Err(Error::InvalidLength),
        }
    }
}

impl fmt::Debug for TlvValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlvValue({} bytes)", self.len)
    }
}

/// Iterator over the logical `(type, value)` records of a TLV buffer.
#[derive(Clone)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Checks that the whole buffer consists of complete records.
    pub fn validate(&self) -> Result<(), Error> {
        let mut pos = self.pos;
        while pos < self.buf.len() {
            if self.buf.len() - pos < 2 {
                return Err(Error::InvalidLength);
            }
            let len = usize::from(self.buf[pos + 1]);
            if self.buf.len() - pos - 2 < len {
                return Err(Error::InvalidLength);
            }
            pos += 2 + len;
        }
        Ok(())
    }

    /// Returns the first logical value of the given type, scanning from the start of the buffer.
    ///
    /// Unknown record types between matches are skipped. Returns `None` for missing types.
    pub fn find(&self, ty: u8) -> Option<TlvValue<'a>> {
        let mut reader = Self::new(self.buf);
        while let Some(result) = reader.next() {
            match result {
                Ok((t, value)) if t == ty => return Some(value),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    }

    /// Returns the first logical value of `ty`, or `Error::InvalidValue` when it is missing.
    pub fn expect(&self, ty: u8) -> Result<TlvValue<'a>, Error> {
        self.find(ty).ok_or(Error::InvalidValue)
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<(u8, TlvValue<'a>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }

        let start = self.pos;
        let mut reader = ByteReader::new(&self.buf[self.pos..]);
        let ty = match reader.read_u8() {
            Ok(ty) => ty,
            Err(e) => return Some(Err(e)),
        };

        // Accumulate the fragment chain: records of the same type chain for as long as each
        // fragment is exactly 255 bytes long.
        let mut total = 0;
        let mut expect_more = true;
        let mut first = true;
        while expect_more {
            if !first {
                match reader.read_u8() {
                    Ok(t) if t == ty => {}
                    // Type change terminates the chain only after a short fragment; a chain cut
                    // off mid-way is malformed and handled below by `expect_more`.
                    _ => return Some(Err(Error::InvalidLength)),
                }
            }
            first = false;
            let len = match reader.read_u8() {
                Ok(len) => usize::from(len),
                Err(e) => return Some(Err(e)),
            };
            if reader.skip(len).is_err() {
                return Some(Err(Error::InvalidLength));
            }
            total += len;
            expect_more = len == MAX_FRAGMENT && {
                // Peek: chain continues only when the next record has the same type.
                let rest = reader.as_raw_bytes();
                rest.first() == Some(&ty)
            };
        }

        let end = self.buf.len() - reader.bytes_left();
        self.pos = end;
        Some(Ok((
            ty,
            TlvValue {
                raw: &self.buf[start..end],
                len: total,
            },
        )))
    }
}

/// Appends logical TLV values to a byte buffer, splitting them into 255-byte records.
///
/// The encoded form grows at the head of the buffer; [`with_scratch`] temporarily carves
/// intermediate space from the tail.
///
/// [`with_scratch`]: #method.with_scratch
pub struct TlvWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> TlvWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Number of encoded bytes at the head of the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes still available for records or scratch.
    pub fn space_left(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Returns the encoded records written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Consumes the writer, returning the encoded length.
    pub fn finish(self) -> usize {
        self.len
    }

    fn bytes_needed(value_len: usize) -> usize {
        // A value that is a non-zero exact multiple of 255 carries an empty terminator record
        // so that a following same-type append cannot merge into the chain; either way the
        // record count is one more than the number of full fragments.
        let records = value_len / MAX_FRAGMENT + 1;
        value_len + 2 * records
    }

    /// Appends one logical value, chaining records as needed.
    ///
    /// Returns `Error::Eof` (out of resources) without writing anything when the encoded form
    /// does not fit.
    pub fn append(&mut self, ty: u8, value: &[u8]) -> Result<(), Error> {
        if Self::bytes_needed(value.len()) > self.space_left() {
            return Err(Error::Eof);
        }

        let mut rest = value;
        loop {
            let frag_len = rest.len().min(MAX_FRAGMENT);
            self.buf[self.len] = ty;
            self.buf[self.len + 1] = frag_len as u8;
            self.buf[self.len + 2..self.len + 2 + frag_len].copy_from_slice(&rest[..frag_len]);
            self.len += 2 + frag_len;
            rest = &rest[frag_len..];
            if rest.is_empty() {
                if frag_len == MAX_FRAGMENT {
                    // Terminate the chain.
                    self.buf[self.len] = ty;
                    self.buf[self.len + 1] = 0;
                    self.len += 2;
                }
                return Ok(());
            }
        }
    }

    /// Appends a single-byte value.
    pub fn append_u8(&mut self, ty: u8, value: u8) -> Result<(), Error> {
        self.append(ty, &[value])
    }

    /// Appends a little-endian unsigned integer, using the fewest bytes that hold the value
    /// (one byte for zero).
    pub fn append_uint_le(&mut self, ty: u8, value: u64) -> Result<(), Error> {
        let bytes = value.to_le_bytes();
        let used = (8 - value.leading_zeros() / 8).max(1) as usize;
        self.append(ty, &bytes[..used])
    }

    /// Appends a zero-length separator record.
    ///
    /// Sequences of same-typed aggregates (eg. pairing listings) are delimited by these.
    pub fn append_separator(&mut self, ty: u8) -> Result<(), Error> {
        self.append(ty, &[])
    }

    /// Carves `scratch_len` bytes from the tail of the buffer and runs `f` with the writer
    /// (restricted to the remaining head space) and the scratch slice.
    ///
    /// The scratch contents are dead after `f` returns; anything that must survive has to be
    /// appended as a record from within `f`.
    pub fn with_scratch<R>(
        &mut self,
        scratch_len: usize,
        f: impl FnOnce(&mut TlvWriter<'_>, &mut [u8]) -> Result<R, Error>,
    ) -> Result<R, Error> {
        if self.space_left() < scratch_len {
            return Err(Error::Eof);
        }
        let split = self.buf.len() - scratch_len;
        let (head, scratch) = self.buf.split_at_mut(split);
        let mut writer = TlvWriter {
            buf: head,
            len: self.len,
        };
        let result = f(&mut writer, scratch);
        self.len = writer.len;
        result
    }
}
