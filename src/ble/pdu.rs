//! HAP-BLE PDU framing: the control field, fixed parameter headers and body fragments.
//!
//! Every PDU starts with a one-byte control field:
//!
//! ```notrust
//! MSb                                            LSb
//! +---------------+----------+--------+----------+
//! | Fragmentation | Reserved |  Type  |  Length  |
//! |     1 bit     |  3 bits  | 3 bits |  1 bit   |
//! +---------------+----------+--------+----------+
//! ```
//!
//! * **`Fragmentation`** is 0 on the first fragment of a PDU and 1 on continuations.
//! * **`Reserved`** bits must be zero.
//! * **`Type`** is `000` for requests and `001` for responses.
//! * **`Length`** selects the control field width; only the 1-byte form (`0`) is defined.
//!
//! A first fragment carries the fixed parameters (request: opcode, TID, characteristic/service
//! instance id; response: TID, status), then a 2-byte little-endian body length iff a body is
//! present. Continuations carry only the TID. A fragment's body bytes may be a strict prefix of
//! the declared body length; reassembly is the transaction engine's job.

use crate::bytes::*;
use crate::utils::HexSlice;
use crate::Error;

/// Body length of a PDU is a u16; no body can exceed this.
pub const MAX_BODY_BYTES: usize = u16::max_value() as usize;

const CONTROL_CONTINUATION: u8 = 1 << 7;
const CONTROL_RESERVED: u8 = 1 << 6 | 1 << 5 | 1 << 4;
const CONTROL_TYPE: u8 = 1 << 3 | 1 << 2 | 1 << 1;
const CONTROL_TYPE_REQUEST: u8 = 0 << 1;
const CONTROL_TYPE_RESPONSE: u8 = 1 << 1;
const CONTROL_LENGTH_1B: u8 = 1 << 0;

enum_with_unknown! {
    /// HAP opcodes carried by request PDUs.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Opcode(u8) {
        CharacteristicSignatureRead = 0x01,
        CharacteristicWrite = 0x02,
        CharacteristicRead = 0x03,
        CharacteristicTimedWrite = 0x04,
        CharacteristicExecuteWrite = 0x05,
        ServiceSignatureRead = 0x06,
        CharacteristicConfiguration = 0x07,
        ProtocolConfiguration = 0x08,
        Token = 0x09,
        TokenUpdate = 0x0A,
        Info = 0x0B,
    }
}

impl Opcode {
    /// Whether the instance id of this operation addresses a service rather than a
    /// characteristic.
    pub fn is_service_operation(&self) -> bool {
        matches!(self, Opcode::ServiceSignatureRead | Opcode::ProtocolConfiguration)
    }
}

enum_with_unknown! {
    /// HAP status codes carried by response PDUs.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Status(u8) {
        Success = 0x00,
        UnsupportedPdu = 0x01,
        MaxProcedures = 0x02,
        InsufficientAuthorization = 0x03,
        InvalidInstanceId = 0x04,
        InsufficientAuthentication = 0x05,
        InvalidRequest = 0x06,
    }
}

/// Fixed parameters of a first fragment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Header {
    Request { opcode: Opcode, tid: u8, iid: u16 },
    Response { tid: u8, status: Status },
}

impl Header {
    pub fn tid(&self) -> u8 {
        match self {
            Header::Request { tid, .. } | Header::Response { tid, .. } => *tid,
        }
    }
}

/// One on-wire PDU fragment.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Fragment<'a> {
    First {
        header: Header,
        /// Declared length of the complete body; `body` below may be shorter.
        body_len: u16,
        body: &'a [u8],
    },
    Continuation {
        tid: u8,
        body: &'a [u8],
    },
}

impl<'a> FromBytes<'a> for Fragment<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let control = bytes.read_u8()?;
        if control & CONTROL_RESERVED != 0 {
            return Err(Error::InvalidValue);
        }
        if control & CONTROL_LENGTH_1B != 0 {
            // Only the 1-byte control field form is defined.
            return Err(Error::InvalidValue);
        }
        let is_response = match control & CONTROL_TYPE {
            CONTROL_TYPE_REQUEST => false,
            CONTROL_TYPE_RESPONSE => true,
            _ => return Err(Error::InvalidValue),
        };

        if control & CONTROL_CONTINUATION != 0 {
            let tid = bytes.read_u8()?;
            return Ok(Fragment::Continuation {
                tid,
                body: bytes.read_rest(),
            });
        }

        let header = if is_response {
            Header::Response {
                tid: bytes.read_u8()?,
                status: Status::from(bytes.read_u8()?),
            }
        } else {
            Header::Request {
                opcode: Opcode::from(bytes.read_u8()?),
                tid: bytes.read_u8()?,
                iid: bytes.read_u16_le()?,
            }
        };

        let (body_len, body) = if bytes.is_empty() {
            (0, &[][..])
        } else {
            let len = bytes.read_u16_le()?;
            let body = bytes.read_rest();
            if body.len() > usize::from(len) {
                return Err(Error::InvalidLength);
            }
            (len, body)
        };

        Ok(Fragment::First {
            header,
            body_len,
            body,
        })
    }
}

impl ToBytes for Fragment<'_> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match *self {
            Fragment::First {
                header,
                body_len,
                body,
            } => {
                match header {
                    Header::Request { opcode, tid, iid } => {
                        writer.write_u8(CONTROL_TYPE_REQUEST)?;
                        writer.write_u8(opcode.into())?;
                        writer.write_u8(tid)?;
                        writer.write_u16_le(iid)?;
                    }
                    Header::Response { tid, status } => {
                        writer.write_u8(CONTROL_TYPE_RESPONSE)?;
                        writer.write_u8(tid)?;
                        writer.write_u8(status.into())?;
                    }
                }
                if body_len > 0 {
                    writer.write_u16_le(body_len)?;
                    writer.write_slice(body)?;
                }
                Ok(())
            }
            Fragment::Continuation { tid, body } => {
                let type_bits = CONTROL_TYPE_RESPONSE; // continuations mirror their PDU type
                writer.write_u8(CONTROL_CONTINUATION | type_bits)?;
                writer.write_u8(tid)?;
                writer.write_slice(body)
            }
        }
    }
}

impl core::fmt::Debug for Fragment<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fragment::First {
                header,
                body_len,
                body,
            } => f
                .debug_struct("First")
                .field("header", header)
                .field("body_len", body_len)
                .field("body", &HexSlice(*body))
                .finish(),
            Fragment::Continuation { tid, body } => f
                .debug_struct("Continuation")
                .field("tid", tid)
                .field("body", &HexSlice(*body))
                .finish(),
        }
    }
}
