//! Setup code handling: SRP parameter derivation and the setup payload.
//!
//! The setup code is accessory-programmed and never learned from the controller. From it the
//! provider derives the SRP salt/verifier pair consumed by Pair Setup M2/M4. Accessories with a
//! display use the split flow instead: they derive the parameters for a freshly displayed code
//! during a transient attempt and must hand the *same* verifier to the follow-up split attempt,
//! which the `restore_previous` flag takes care of.

use crate::crypto::srp;
use crate::utils::HexSlice;
use bitflags::bitflags;
use core::fmt;
use rand_core::{CryptoRng, RngCore};

use super::Category;

/// Length of the `XXX-XX-XXX` setup code string.
pub const SETUP_CODE_BYTES: usize = 10;

/// Length of a setup id.
pub const SETUP_ID_BYTES: usize = 4;

/// Codes that are too guessable to be allowed, per the protocol specification.
const TRIVIAL_CODES: [&[u8; SETUP_CODE_BYTES]; 12] = [
    b"000-00-000",
    b"111-11-111",
    b"222-22-222",
    b"333-33-333",
    b"444-44-444",
    b"555-55-555",
    b"666-66-666",
    b"777-77-777",
    b"888-88-888",
    b"999-99-999",
    b"123-45-678",
    b"876-54-321",
];

/// An 8-digit setup code in `XXX-XX-XXX` form.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SetupCode([u8; SETUP_CODE_BYTES]);

impl SetupCode {
    /// Validates and wraps a setup code string.
    ///
    /// Rejects malformed strings and the trivial codes controllers refuse to accept.
    pub fn new(code: &[u8]) -> Option<Self> {
        if code.len() != SETUP_CODE_BYTES || code[3] != b'-' || code[6] != b'-' {
            return None;
        }
        for (i, byte) in code.iter().enumerate() {
            if i != 3 && i != 6 && !byte.is_ascii_digit() {
                return None;
            }
        }
        let mut bytes = [0; SETUP_CODE_BYTES];
        bytes.copy_from_slice(code);
        if TRIVIAL_CODES.iter().any(|c| **c == bytes) {
            return None;
        }
        Some(SetupCode(bytes))
    }

    /// The code as it is fed into SRP (including the dashes).
    pub fn as_bytes(&self) -> &[u8; SETUP_CODE_BYTES] {
        &self.0
    }

    /// The code as a number, for the setup payload.
    fn numeric(&self) -> u32 {
        self.0
            .iter()
            .filter(|b| b.is_ascii_digit())
            .fold(0, |acc, b| acc * 10 + u32::from(b - b'0'))
    }
}

impl fmt::Debug for SetupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The code is a credential; don't leak it through logs.
        f.write_str("SetupCode(***-**-***)")
    }
}

/// A 4-character Base36 setup id, discriminating accessories on shared displays.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SetupId([u8; SETUP_ID_BYTES]);

impl SetupId {
    pub fn new(id: &[u8]) -> Option<Self> {
        if id.len() != SETUP_ID_BYTES {
            return None;
        }
        let mut bytes = [0; SETUP_ID_BYTES];
        for (out, byte) in bytes.iter_mut().zip(id) {
            if !byte.is_ascii_digit() && !byte.is_ascii_uppercase() {
                return None;
            }
            *out = *byte;
        }
        Some(SetupId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SETUP_ID_BYTES] {
        &self.0
    }
}

impl fmt::Debug for SetupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(core::str::from_utf8(&self.0).unwrap())
    }
}

bitflags! {
    /// Transport flags encoded into the setup payload.
    pub struct SetupFlags: u8 {
        const NFC = 1 << 0;
        const IP = 1 << 1;
        const BLE = 1 << 2;
    }
}

/// The SRP parameters derived from a setup code.
#[derive(Clone)]
pub struct SetupInfo {
    pub salt: [u8; srp::SALT_BYTES],
    pub verifier: [u8; srp::PRIME_BYTES],
}

impl fmt::Debug for SetupInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupInfo")
            .field("salt", &HexSlice(&self.salt[..]))
            .finish()
    }
}

/// Caches the SRP parameters for the lifetime of one Pair Setup attempt.
///
/// In split mode the parameters survive into the follow-up attempt; everywhere else they are
/// dropped when the attempt ends.
pub struct SetupInfoCache {
    info: Option<SetupInfo>,
}

impl SetupInfoCache {
    pub const fn new() -> Self {
        Self { info: None }
    }

    /// Returns the parameters for the current attempt.
    ///
    /// With `restore_previous` set (split Pair Setup M2/M4), only a previously derived verifier
    /// qualifies; `None` is returned when there is none, and the caller fails the attempt with
    /// an authentication error. Otherwise the cached parameters are returned, deriving them
    /// first when this is the attempt's initial request.
    pub fn get<R>(
        &mut self,
        code: &SetupCode,
        rng: &mut R,
        restore_previous: bool,
    ) -> Option<&SetupInfo>
    where
        R: RngCore + CryptoRng,
    {
        if restore_previous {
            return self.info.as_ref();
        }
        if self.info.is_none() {
            let mut salt = [0; srp::SALT_BYTES];
            rng.fill_bytes(&mut salt);
            let verifier = srp::verifier(srp::USERNAME, code.as_bytes(), &salt);
            self.info = Some(SetupInfo { salt, verifier });
        }
        self.info.as_ref()
    }

    /// Ends the current attempt.
    ///
    /// `keep` preserves the parameters for a follow-up split attempt.
    pub fn reset(&mut self, keep: bool) {
        if !keep {
            self.info = None;
        }
    }
}

/// Length of the textual setup payload.
pub const SETUP_PAYLOAD_BYTES: usize = 20;

/// A setup payload, `X-HM://` followed by nine Base36 digits and the setup id.
///
/// The same string is rendered as QR code or NFC tag by the application.
pub struct SetupPayload([u8; SETUP_PAYLOAD_BYTES]);

impl SetupPayload {
    /// Encodes the payload for a setup code and id.
    pub fn new(
        code: &SetupCode,
        setup_id: &SetupId,
        category: Category,
        flags: SetupFlags,
    ) -> Self {
        // version:3 reserved:4 category:10 flags:4 setup_code:27, Base36 big-endian.
        let version = 0u64;
        let mut value = version << 45
            | u64::from(u16::from(category)) << 31
            | u64::from(flags.bits()) << 27
            | u64::from(code.numeric());

        const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let mut out = [0; SETUP_PAYLOAD_BYTES];
        out[..7].copy_from_slice(b"X-HM://");
        for i in (7..16).rev() {
            out[i] = DIGITS[(value % 36) as usize];
            value /= 36;
        }
        out[16..].copy_from_slice(setup_id.as_bytes());
        SetupPayload(out)
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).unwrap()
    }
}

impl fmt::Display for SetupPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
