//! Pairing records and their durable store, plus the add/remove/list pairing operations.
//!
//! A pairing binds a controller identifier (≤ 36 bytes) to its Ed25519 long-term public key and
//! a permission bitmask. Each pairing occupies one slot in the `Pairings` key-value domain,
//! keyed by an 8-bit slot number. Lookup by identifier is a linear scan over occupied slots;
//! slot order carries no meaning.

pub mod cache;
pub mod pair_setup;
pub mod pair_verify;

use crate::accessory::setup::{SetupCode, SetupInfoCache};
use crate::accessory::Identity;
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::crypto::ED25519_PUBLIC_KEY_BYTES;
use crate::platform::{Domain, KeyValueStore, PlatformConfig};
use crate::time::Instant;
use crate::utils::HexSlice;
use crate::{Error, HapError};
use bitflags::bitflags;
use core::fmt;

/// The capability and identity slices the pairing engines borrow from the server for the
/// duration of one message.
pub struct PairingResources<'a, C: PlatformConfig> {
    pub store: &'a mut C::Store,
    pub rng: &'a mut C::Rng,
    pub now: Instant,
    pub auth: Option<&'a C::Auth>,
    pub identity: &'a Identity,
    pub setup_code: &'a SetupCode,
    pub setup_info: &'a mut SetupInfoCache,
    pub session_cache: &'a mut cache::SessionCache,
}

/// TLV types used by the pairing protocol messages.
pub mod tlv_type {
    pub const METHOD: u8 = 0x00;
    pub const IDENTIFIER: u8 = 0x01;
    pub const SALT: u8 = 0x02;
    pub const PUBLIC_KEY: u8 = 0x03;
    pub const PROOF: u8 = 0x04;
    pub const ENCRYPTED_DATA: u8 = 0x05;
    pub const STATE: u8 = 0x06;
    pub const ERROR: u8 = 0x07;
    pub const RETRY_DELAY: u8 = 0x08;
    pub const CERTIFICATE: u8 = 0x09;
    pub const SIGNATURE: u8 = 0x0A;
    pub const PERMISSIONS: u8 = 0x0B;
    pub const FRAGMENT_DATA: u8 = 0x0C;
    pub const FRAGMENT_LAST: u8 = 0x0D;
    pub const SESSION_ID: u8 = 0x0E;
    pub const FLAGS: u8 = 0x13;
    pub const SEPARATOR: u8 = 0xFF;
}

enum_with_unknown! {
    /// Pairing method carried in `kTLVType_Method`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Method(u8) {
        PairSetupWithAuth = 0,
        PairSetup = 1,
        PairVerify = 2,
        AddPairing = 3,
        RemovePairing = 4,
        ListPairings = 5,
        PairResume = 6,
    }
}

/// Error codes carried in `kTLVType_Error`. Terminal for the running procedure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PairingError {
    Unknown = 1,
    Authentication = 2,
    Backoff = 3,
    MaxPeers = 4,
    MaxTries = 5,
    Unavailable = 6,
    Busy = 7,
}

impl ::core::convert::From<u8> for PairingError {
    fn from(value: u8) -> Self {
        match value {
            1 => PairingError::Unknown,
            2 => PairingError::Authentication,
            3 => PairingError::Backoff,
            4 => PairingError::MaxPeers,
            5 => PairingError::MaxTries,
            6 => PairingError::Unavailable,
            7 => PairingError::Busy,
            _ => PairingError::Unknown,
        }
    }
}

impl ::core::convert::From<PairingError> for u8 {
    fn from(value: PairingError) -> Self {
        match value {
            PairingError::Unknown => 1,
            PairingError::Authentication => 2,
            PairingError::Backoff => 3,
            PairingError::MaxPeers => 4,
            PairingError::MaxTries => 5,
            PairingError::Unavailable => 6,
            PairingError::Busy => 7,
        }
    }
}

impl From<HapError> for PairingError {
    fn from(e: HapError) -> Self {
        match e {
            HapError::Authentication => PairingError::Authentication,
            HapError::Busy => PairingError::Busy,
            HapError::OutOfResources => PairingError::MaxPeers,
            HapError::InvalidState => PairingError::Unavailable,
            _ => PairingError::Unknown,
        }
    }
}

bitflags! {
    /// Controller permissions stored with each pairing.
    pub struct Permissions: u8 {
        const ADMIN = 1 << 0;
    }
}

/// Maximum identifier length accepted on write and enforced on load.
pub const MAX_IDENTIFIER_BYTES: usize = 36;

/// Number of pairing slots; exceeding it fails Pair Setup M5 with `MaxPeers` and add-pairing
/// with `OutOfResources`.
pub const MAX_PAIRINGS: u8 = 16;

/// One stored pairing.
#[derive(Clone, PartialEq, Eq)]
pub struct Pairing {
    identifier: [u8; MAX_IDENTIFIER_BYTES],
    identifier_len: u8,
    pub public_key: [u8; ED25519_PUBLIC_KEY_BYTES],
    pub permissions: Permissions,
}

impl Pairing {
    pub fn new(
        identifier: &[u8],
        public_key: [u8; ED25519_PUBLIC_KEY_BYTES],
        permissions: Permissions,
    ) -> Result<Self, HapError> {
        if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_BYTES {
            return Err(HapError::InvalidData);
        }
        let mut id = [0; MAX_IDENTIFIER_BYTES];
        id[..identifier.len()].copy_from_slice(identifier);
        Ok(Pairing {
            identifier: id,
            identifier_len: identifier.len() as u8,
            public_key,
            permissions,
        })
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier[..usize::from(self.identifier_len)]
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.contains(Permissions::ADMIN)
    }
}

impl fmt::Debug for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pairing")
            .field("identifier", &HexSlice(self.identifier()))
            .field("permissions", &self.permissions)
            .finish()
    }
}

impl ToBytes for Pairing {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.identifier_len)?;
        writer.write_slice(&self.identifier)?;
        writer.write_slice(&self.public_key)?;
        writer.write_u8(self.permissions.bits())
    }
}

impl<'a> FromBytes<'a> for Pairing {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let identifier_len = bytes.read_u8()?;
        if identifier_len == 0 || usize::from(identifier_len) > MAX_IDENTIFIER_BYTES {
            // Reject corrupted store records instead of propagating oversized identifiers.
            return Err(Error::InvalidValue);
        }
        let identifier = bytes.read_array()?;
        let public_key = bytes.read_array()?;
        let permissions = Permissions::from_bits_truncate(bytes.read_u8()?);
        Ok(Pairing {
            identifier,
            identifier_len,
            public_key,
            permissions,
        })
    }
}

/// Size of one serialized pairing record.
const RECORD_BYTES: usize = 1 + MAX_IDENTIFIER_BYTES + ED25519_PUBLIC_KEY_BYTES + 1;

/// Slot-keyed pairing storage on top of the key-value store.
///
/// This type is stateless; it only carries the domain logic.
pub struct PairingStore;

impl PairingStore {
    /// Reads the pairing in `slot`, if any.
    pub fn get<S: KeyValueStore>(store: &S, slot: u8) -> Result<Option<Pairing>, HapError> {
        let mut buf = [0; RECORD_BYTES];
        match store.get(Domain::Pairings, slot, &mut buf)? {
            None => Ok(None),
            Some(bytes) => {
                let mut reader = ByteReader::new(bytes);
                let pairing = Pairing::from_bytes(&mut reader).map_err(|_| HapError::Unknown)?;
                if !reader.is_empty() {
                    return Err(HapError::Unknown);
                }
                Ok(Some(pairing))
            }
        }
    }

    /// Writes `pairing` into `slot`.
    pub fn set<S: KeyValueStore>(
        store: &mut S,
        slot: u8,
        pairing: &Pairing,
    ) -> Result<(), HapError> {
        let mut buf = [0; RECORD_BYTES];
        let mut writer = ByteWriter::new(&mut buf);
        pairing.to_bytes(&mut writer).map_err(HapError::from)?;
        store.set(Domain::Pairings, slot, &buf)
    }

    /// Removes the pairing in `slot`.
    pub fn remove<S: KeyValueStore>(store: &mut S, slot: u8) -> Result<(), HapError> {
        store.remove(Domain::Pairings, slot)
    }

    /// Finds a pairing by controller identifier. Linear over occupied slots.
    pub fn find<S: KeyValueStore>(
        store: &S,
        identifier: &[u8],
    ) -> Result<Option<(u8, Pairing)>, HapError> {
        let mut found = None;
        Self::for_each(store, |slot, pairing| {
            if pairing.identifier() == identifier {
                found = Some((slot, pairing));
                Ok(false)
            } else {
                Ok(true)
            }
        })?;
        Ok(found)
    }

    /// Returns a free slot, or `None` when all [`MAX_PAIRINGS`] slots are taken.
    ///
    /// [`MAX_PAIRINGS`]: constant.MAX_PAIRINGS.html
    pub fn free_slot<S: KeyValueStore>(store: &S) -> Result<Option<u8>, HapError> {
        let mut buf = [0; RECORD_BYTES];
        for slot in 0..MAX_PAIRINGS {
            if store.get(Domain::Pairings, slot, &mut buf)?.is_none() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Calls `f` for every stored pairing until it returns `false`.
    pub fn for_each<S: KeyValueStore>(
        store: &S,
        mut f: impl FnMut(u8, Pairing) -> Result<bool, HapError>,
    ) -> Result<(), HapError> {
        store.enumerate(Domain::Pairings, &mut |slot| match Self::get(store, slot)? {
            Some(pairing) => f(slot, pairing),
            None => Ok(true),
        })
    }

    /// Whether any pairing exists (ie. the accessory is paired).
    pub fn any<S: KeyValueStore>(store: &S) -> Result<bool, HapError> {
        let mut any = false;
        Self::for_each(store, |_, _| {
            any = true;
            Ok(false)
        })?;
        Ok(any)
    }

    /// Whether any admin pairing exists.
    pub fn any_admin<S: KeyValueStore>(store: &S) -> Result<bool, HapError> {
        let mut any = false;
        Self::for_each(store, |_, pairing| {
            if pairing.is_admin() {
                any = true;
                Ok(false)
            } else {
                Ok(true)
            }
        })?;
        Ok(any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::MemoryStore;

    fn pairing(id: &[u8], admin: bool) -> Pairing {
        let permissions = if admin {
            Permissions::ADMIN
        } else {
            Permissions::empty()
        };
        Pairing::new(id, [9; 32], permissions).unwrap()
    }

    #[test]
    fn record_round_trip() {
        let mut store = MemoryStore::new();
        let p = pairing(b"AA:BB:CC:DD:EE:FF", true);
        PairingStore::set(&mut store, 3, &p).unwrap();
        let loaded = PairingStore::get(&store, 3).unwrap().unwrap();
        assert_eq!(loaded, p);
        assert!(PairingStore::get(&store, 4).unwrap().is_none());
    }

    #[test]
    fn find_by_identifier() {
        let mut store = MemoryStore::new();
        PairingStore::set(&mut store, 0, &pairing(b"first", true)).unwrap();
        PairingStore::set(&mut store, 5, &pairing(b"second", false)).unwrap();

        let (slot, found) = PairingStore::find(&store, b"second").unwrap().unwrap();
        assert_eq!(slot, 5);
        assert!(!found.is_admin());
        assert!(PairingStore::find(&store, b"third").unwrap().is_none());
    }

    #[test]
    fn slots_are_bounded() {
        let mut store = MemoryStore::new();
        for slot in 0..MAX_PAIRINGS {
            assert_eq!(PairingStore::free_slot(&store).unwrap(), Some(slot));
            PairingStore::set(&mut store, slot, &pairing(b"x", false)).unwrap();
        }
        assert_eq!(PairingStore::free_slot(&store).unwrap(), None);
    }

    #[test]
    fn identifier_length_is_enforced() {
        assert!(Pairing::new(&[b'a'; 37], [0; 32], Permissions::ADMIN).is_err());
        assert!(Pairing::new(b"", [0; 32], Permissions::ADMIN).is_err());

        // A corrupted record (oversized identifier) is rejected on load.
        let mut store = MemoryStore::new();
        let mut raw = [0xEE; RECORD_BYTES];
        raw[0] = 40;
        store.set(Domain::Pairings, 0, &raw).unwrap();
        assert_eq!(PairingStore::get(&store, 0), Err(HapError::Unknown));
    }

    #[test]
    fn admin_scan() {
        let mut store = MemoryStore::new();
        assert!(!PairingStore::any(&store).unwrap());
        PairingStore::set(&mut store, 1, &pairing(b"user", false)).unwrap();
        assert!(PairingStore::any(&store).unwrap());
        assert!(!PairingStore::any_admin(&store).unwrap());
        PairingStore::set(&mut store, 2, &pairing(b"admin", true)).unwrap();
        assert!(PairingStore::any_admin(&store).unwrap());
    }
}
