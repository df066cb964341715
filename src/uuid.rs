//! HAP UUIDs (Apple-defined short forms and full 128 bits).
//!
//! HomeKit assigns UUIDs to identify services and characteristics. Apple-defined types share the
//! HAP Base UUID, `00000000-0000-1000-8000-0026BB765291`, and differ only in the first 4 bytes.
//! Such UUIDs can be represented and transmitted in a compressed short form of 1, 2 or 4 bytes.
//!
//! On the wire (BLE signature reads), UUIDs are transmitted in reversed byte order relative to
//! their textual representation.

use crate::{bytes::*, Error};
use core::fmt;

const BASE_UUID: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, /*-*/ 0x00, 0x00, /*-*/ 0x10, 0x00, /*-*/ 0x80, 0x00,
    /*-*/ 0x00, 0x26, 0xBB, 0x76, 0x52, 0x91,
];

/// A full 128-bit HAP UUID.
///
/// Stored in the big-endian order used by the textual representation.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct HapUuid([u8; 16]);

impl HapUuid {
    /// Creates a HAP UUID from 16 raw bytes (encoded in big-endian).
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates an Apple-defined UUID by embedding `short` into the HAP Base UUID.
    pub const fn apple_defined(short: u32) -> Self {
        let s = short.to_be_bytes();
        let mut bytes = BASE_UUID;
        bytes[0] = s[0];
        bytes[1] = s[1];
        bytes[2] = s[2];
        bytes[3] = s[3];
        Self(bytes)
    }

    /// Parses a UUID string literal, panicking when the string is malformed.
    ///
    /// This is meant to be used in constant contexts.
    pub const fn parse_static(s: &'static str) -> Self {
        const fn parse_nibble(nibble: u8) -> u8 {
            match nibble {
                b'0'..=b'9' => nibble - b'0',
                b'A'..=b'F' => nibble - b'A' + 10,
                b'a'..=b'f' => nibble - b'a' + 10,
                _ => panic!("hex digit out of range"),
            }
        }

        // full UUID: 0000003E-0000-1000-8000-0026BB765291 (36 chars)
        // dashes at offsets 8, 13, 18, 23
        let mut index = 0;
        let mut bytes = [0; 16];

        macro_rules! eat_byte {
            ($s:ident[$i:ident..]) => {{
                let hi = parse_nibble($s.as_bytes()[$i]);
                $i += 1;
                let lo = parse_nibble($s.as_bytes()[$i]);
                $i += 1;
                (hi << 4) | lo
            }};
        }

        macro_rules! eat_dash {
            ($s:ident[$i:ident..]) => {{
                match $s.as_bytes()[$i] {
                    b'-' => {}
                    _ => panic!("expected '-'"),
                }
                $i += 1;
            }};
        }

        bytes[0] = eat_byte!(s[index..]);
        bytes[1] = eat_byte!(s[index..]);
        bytes[2] = eat_byte!(s[index..]);
        bytes[3] = eat_byte!(s[index..]);
        eat_dash!(s[index..]);
        bytes[4] = eat_byte!(s[index..]);
        bytes[5] = eat_byte!(s[index..]);
        eat_dash!(s[index..]);
        bytes[6] = eat_byte!(s[index..]);
        bytes[7] = eat_byte!(s[index..]);
        eat_dash!(s[index..]);
        bytes[8] = eat_byte!(s[index..]);
        bytes[9] = eat_byte!(s[index..]);
        eat_dash!(s[index..]);
        bytes[10] = eat_byte!(s[index..]);
        bytes[11] = eat_byte!(s[index..]);
        bytes[12] = eat_byte!(s[index..]);
        bytes[13] = eat_byte!(s[index..]);
        bytes[14] = eat_byte!(s[index..]);
        bytes[15] = eat_byte!(s[index..]);

        // String must end here.
        if s.len() > index {
            panic!("unexpected trailing data");
        }

        HapUuid(bytes)
    }

    /// Returns the raw bytes in textual (big-endian) order.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns whether this UUID is derived from the HAP Base UUID.
    pub fn is_apple_defined(&self) -> bool {
        self.0[4..] == BASE_UUID[4..]
    }

    /// Returns the embedded short value if this is an Apple-defined UUID.
    pub fn short(&self) -> Option<u32> {
        if self.is_apple_defined() {
            Some(u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]))
        } else {
            None
        }
    }

    /// Writes the compressed wire form: 1, 2 or 4 little-endian bytes for Apple-defined UUIDs
    /// (as short as the embedded value allows), the full reversed 16 bytes otherwise.
    pub fn write_short_form(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match self.short() {
            Some(short) if short <= 0xFF => writer.write_u8(short as u8),
            Some(short) if short <= 0xFFFF => writer.write_u16_le(short as u16),
            Some(short) => writer.write_u32_le(short),
            None => self.to_bytes(writer),
        }
    }
}

/// Writes the full UUID in reversed (wire) byte order.
impl ToBytes for HapUuid {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let mut reversed = self.0;
        reversed.reverse();
        writer.write_slice(&reversed)
    }
}

/// Reads a full UUID from its reversed (wire) byte order.
impl<'a> FromBytes<'a> for HapUuid {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let mut uuid: [u8; 16] = bytes.read_array()?;
        uuid.reverse();
        Ok(HapUuid(uuid))
    }
}

impl fmt::Display for HapUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for HapUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apple_defined_short_forms() {
        // Pairing Service.
        let uuid = HapUuid::parse_static("00000055-0000-1000-8000-0026BB765291");
        assert!(uuid.is_apple_defined());
        assert_eq!(uuid.short(), Some(0x55));
        assert_eq!(uuid, HapUuid::apple_defined(0x55));

        let mut buf = [0; 16];
        let mut writer = ByteWriter::new(&mut buf);
        uuid.write_short_form(&mut writer).unwrap();
        assert_eq!(writer.space_left(), 15);
        assert_eq!(buf[0], 0x55);
    }

    #[test]
    fn vendor_uuid_keeps_full_form() {
        let uuid = HapUuid::parse_static("34AB8811-AC7F-4340-BAC3-FD6A85F9943B");
        assert!(!uuid.is_apple_defined());
        assert_eq!(uuid.short(), None);

        let mut buf = [0; 16];
        let mut writer = ByteWriter::new(&mut buf);
        uuid.write_short_form(&mut writer).unwrap();
        assert_eq!(writer.space_left(), 0);
        // Reversed wire order: last textual byte first.
        assert_eq!(buf[0], 0x3B);
        assert_eq!(buf[15], 0x34);
    }

    #[test]
    fn wire_round_trip() {
        let uuid = HapUuid::apple_defined(0x0112_2334);
        let mut buf = [0; 16];
        uuid.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        let decoded = <HapUuid as FromBytes>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(decoded, uuid);
    }
}
