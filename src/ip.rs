//! The IP transport core: encrypted record framing, endpoint routing and timed-write windows.
//!
//! After Pair Verify, every HTTP request and response travels inside ChaCha20-Poly1305 records
//! of at most 1024 ciphertext bytes. The two-byte little-endian ciphertext length doubles as
//! the record's AAD. Parsing the HTTP text itself and formatting JSON bodies happens outside
//! the core; this module stops at records, endpoint identification and the status mapping.

use crate::crypto::CHACHA20_POLY1305_TAG_BYTES;
use crate::session::Session;
use crate::time::{Duration, Instant};
use crate::HapError;

/// Ciphertext bytes per encrypted record.
pub const MAX_RECORD_CIPHERTEXT: usize = 1024;

/// On-wire overhead of one record: length prefix plus AEAD tag.
pub const RECORD_OVERHEAD: usize = 2 + CHACHA20_POLY1305_TAG_BYTES;

/// Encrypts one outbound record in place.
///
/// `frame[2..2 + plaintext_len]` must hold the plaintext; the length prefix and trailing tag
/// are filled in. Returns the total record length.
pub fn seal(
    session: &mut Session,
    frame: &mut [u8],
    plaintext_len: usize,
) -> Result<usize, HapError> {
    if plaintext_len > MAX_RECORD_CIPHERTEXT {
        return Err(HapError::InvalidData);
    }
    if frame.len() < 2 + plaintext_len + CHACHA20_POLY1305_TAG_BYTES {
        return Err(HapError::OutOfResources);
    }

    let aad = (plaintext_len as u16).to_le_bytes();
    frame[..2].copy_from_slice(&aad);
    let tag = session.encrypt_outbound(&aad, &mut frame[2..2 + plaintext_len])?;
    frame[2 + plaintext_len..2 + plaintext_len + tag.len()].copy_from_slice(&tag);
    Ok(2 + plaintext_len + tag.len())
}

/// Decrypts one inbound record in place, returning the plaintext.
///
/// The record must be complete (`length + 2 + 16` bytes). An authentication failure has
/// already invalidated the session when this returns `Authentication`.
pub fn open<'a>(session: &mut Session, frame: &'a mut [u8]) -> Result<&'a [u8], HapError> {
    if frame.len() < RECORD_OVERHEAD {
        return Err(HapError::InvalidData);
    }
    let mut aad = [0; 2];
    aad.copy_from_slice(&frame[..2]);
    let len = usize::from(u16::from_le_bytes(aad));
    if len > MAX_RECORD_CIPHERTEXT || frame.len() != RECORD_OVERHEAD + len {
        return Err(HapError::InvalidData);
    }

    let (body, tag_bytes) = frame[2..].split_at_mut(len);
    let mut tag = [0; CHACHA20_POLY1305_TAG_BYTES];
    tag.copy_from_slice(tag_bytes);
    session.decrypt_inbound(&aad, body, &tag)?;
    Ok(&frame[2..2 + len])
}

/// The HTTP endpoints served by an accessory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `POST /pair-setup`
    PairSetup,
    /// `POST /pair-verify`
    PairVerify,
    /// `POST /pairings` (add/remove/list)
    Pairings,
    /// `GET /accessories`
    Accessories,
    /// `GET /characteristics?...`
    ReadCharacteristics,
    /// `PUT /characteristics`
    WriteCharacteristics,
    /// `PUT /prepare`
    Prepare,
    /// `POST /identify` (unpaired identify)
    Identify,
    /// `GET /resource` (camera snapshot; outside the core)
    Resource,
}

impl Endpoint {
    /// Identifies the endpoint for a request line. Query strings are ignored.
    pub fn resolve(method: &str, path: &str) -> Option<Endpoint> {
        let path = path.split('?').next().unwrap_or(path);
        Some(match (method, path) {
            ("POST", "/pair-setup") => Endpoint::PairSetup,
            ("POST", "/pair-verify") => Endpoint::PairVerify,
            ("POST", "/pairings") => Endpoint::Pairings,
            ("GET", "/accessories") => Endpoint::Accessories,
            ("GET", "/characteristics") => Endpoint::ReadCharacteristics,
            ("PUT", "/characteristics") => Endpoint::WriteCharacteristics,
            ("PUT", "/prepare") => Endpoint::Prepare,
            ("POST", "/identify") => Endpoint::Identify,
            ("GET", "/resource") => Endpoint::Resource,
            _ => return None,
        })
    }

    /// Whether the endpoint may be used before a session is verified.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Endpoint::PairSetup | Endpoint::PairVerify | Endpoint::Identify
        )
    }
}

/// HTTP status an error kind maps to on the IP transport.
pub fn http_status(error: HapError) -> u16 {
    match error {
        HapError::InvalidData => 400,
        HapError::NotAuthorized | HapError::Authentication => 470,
        HapError::Busy => 503,
        HapError::InvalidState | HapError::OutOfResources | HapError::Unknown => 500,
    }
}

/// A timed-write window opened by `PUT /prepare`.
///
/// The follow-up `PUT /characteristics` must present the same `pid` before the TTL elapses;
/// anything else is `InvalidData` and the write never reaches the application.
#[derive(Debug, Copy, Clone)]
pub struct PreparedWrite {
    pid: u64,
    deadline: Instant,
}

impl PreparedWrite {
    /// Opens a window of `ttl` starting at `now`, replacing any previous one.
    pub fn open(pid: u64, ttl: Duration, now: Instant) -> Self {
        PreparedWrite {
            pid,
            deadline: now + ttl,
        }
    }

    /// Consumes the window for a write carrying `pid`.
    pub fn redeem(self, pid: u64, now: Instant) -> Result<(), HapError> {
        if pid != self.pid || now > self.deadline {
            return Err(HapError::InvalidData);
        }
        Ok(())
    }
}
