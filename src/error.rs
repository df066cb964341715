use core::fmt;

/// Errors returned by the wire codecs.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    ///
    /// This indicates a protocol violation, so the connection should be
    /// considered lost (if one is currently established).
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when the caller tries to fit too much data into a
    /// PDU or other fixed-size buffer, and also when reaching EOF prematurely
    /// while reading data from a buffer.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
        })
    }
}

/// Protocol-level error kinds reported to peers and to the application.
///
/// Every fallible HAP operation resolves to one of these kinds. Apart from
/// `Authentication` and `Unknown`, returning an error leaves the session
/// usable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HapError {
    /// Malformed TLV, value out of constraint, or bad state transition.
    InvalidData,

    /// Operation not permitted in the current state.
    InvalidState,

    /// Buffers or pairing slots exhausted.
    OutOfResources,

    /// Admin permission required, or unpaired access to a secured
    /// characteristic.
    NotAuthorized,

    /// The server is momentarily unable to serve the request (eg. the Pair
    /// Setup slot is held by another session).
    Busy,

    /// SRP proof mismatch, Ed25519 verification failure, or AEAD tag failure.
    ///
    /// Resets the running procedure; inside an active session it invalidates
    /// the session.
    Authentication,

    /// An underlying capability reported failure.
    Unknown,
}

impl fmt::Display for HapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HapError::InvalidData => "invalid data",
            HapError::InvalidState => "invalid state",
            HapError::OutOfResources => "out of resources",
            HapError::NotAuthorized => "not authorized",
            HapError::Busy => "busy",
            HapError::Authentication => "authentication failure",
            HapError::Unknown => "unknown platform failure",
        })
    }
}

/// Codec failures surface to peers as malformed data.
impl From<Error> for HapError {
    fn from(e: Error) -> Self {
        match e {
            Error::Eof => HapError::OutOfResources,
            _ => HapError::InvalidData,
        }
    }
}
