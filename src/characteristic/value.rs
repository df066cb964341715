//! The per-format wire codec and constraint validation for characteristic values.
//!
//! Every format has a fixed little-endian wire encoding; strings are UTF-8 without embedded
//! NUL, `tlv8` and `data` are raw bytes. Values arriving from a controller are validated
//! against the characteristic's constraints before the application sees them.

use crate::bytes::{ByteWriter, ToBytes};
use crate::{Error, HapError};

use super::{FormatSpec, Range};

/// Upper bound on the wire size of any written value.
pub const MAX_WRITE_BYTES: usize = 64_000;

/// A characteristic value, borrowed from the request body or from application storage.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value<'a> {
    Bool(bool),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Float32(f32),
    String(&'a str),
    Tlv8(&'a [u8]),
    Data(&'a [u8]),
}

impl ToBytes for Value<'_> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match *self {
            Value::Bool(v) => writer.write_u8(v as u8),
            Value::UInt8(v) => writer.write_u8(v),
            Value::UInt16(v) => writer.write_u16_le(v),
            Value::UInt32(v) => writer.write_u32_le(v),
            Value::UInt64(v) => writer.write_u64_le(v),
            Value::Int32(v) => writer.write_u32_le(v as u32),
            Value::Float32(v) => writer.write_u32_le(v.to_bits()),
            Value::String(v) => writer.write_slice(v.as_bytes()),
            Value::Tlv8(v) | Value::Data(v) => writer.write_slice(v),
        }
    }
}

fn check_range<T: Copy + PartialOrd>(value: T, range: &Range<T>) -> Result<(), HapError> {
    if let Some(min) = range.min {
        if value < min {
            return Err(HapError::InvalidData);
        }
    }
    if let Some(max) = range.max {
        if value > max {
            return Err(HapError::InvalidData);
        }
    }
    Ok(())
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], HapError> {
    if bytes.len() != N {
        return Err(HapError::InvalidData);
    }
    let mut out = [0; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decodes and validates a written value against the characteristic's format spec.
///
/// Violations of size, encoding or constraints are `InvalidData`.
pub fn parse<'a>(format: &FormatSpec, bytes: &'a [u8]) -> Result<Value<'a>, HapError> {
    if bytes.len() > MAX_WRITE_BYTES {
        return Err(HapError::InvalidData);
    }

    match format {
        FormatSpec::Bool => match bytes {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(HapError::InvalidData),
        },
        FormatSpec::UInt8 {
            range,
            valid_values,
            valid_values_ranges,
        } => {
            let [value] = fixed::<1>(bytes)?;
            check_range(value, range)?;
            if !valid_values.is_empty() && valid_values.binary_search(&value).is_err() {
                return Err(HapError::InvalidData);
            }
            if !valid_values_ranges.is_empty()
                && !valid_values_ranges
                    .iter()
                    .any(|(lo, hi)| (*lo..=*hi).contains(&value))
            {
                return Err(HapError::InvalidData);
            }
            Ok(Value::UInt8(value))
        }
        FormatSpec::UInt16 { range } => {
            let value = u16::from_le_bytes(fixed(bytes)?);
            check_range(value, range)?;
            Ok(Value::UInt16(value))
        }
        FormatSpec::UInt32 { range } => {
            let value = u32::from_le_bytes(fixed(bytes)?);
            check_range(value, range)?;
            Ok(Value::UInt32(value))
        }
        FormatSpec::UInt64 { range } => {
            let value = u64::from_le_bytes(fixed(bytes)?);
            check_range(value, range)?;
            Ok(Value::UInt64(value))
        }
        FormatSpec::Int32 { range } => {
            let value = i32::from_le_bytes(fixed(bytes)?);
            check_range(value, range)?;
            Ok(Value::Int32(value))
        }
        FormatSpec::Float32 { range } => {
            let value = f32::from_bits(u32::from_le_bytes(fixed(bytes)?));
            if value.is_nan() {
                return Err(HapError::InvalidData);
            }
            check_range(value, range)?;
            Ok(Value::Float32(value))
        }
        FormatSpec::String { max_len } => {
            if bytes.len() > usize::from(*max_len) {
                return Err(HapError::InvalidData);
            }
            let s = core::str::from_utf8(bytes).map_err(|_| HapError::InvalidData)?;
            if s.bytes().any(|b| b == 0) {
                return Err(HapError::InvalidData);
            }
            Ok(Value::String(s))
        }
        FormatSpec::Tlv8 => Ok(Value::Tlv8(bytes)),
        FormatSpec::Data { max_len } => {
            if bytes.len() as u64 > u64::from(*max_len) {
                return Err(HapError::InvalidData);
            }
            Ok(Value::Data(bytes))
        }
    }
}
