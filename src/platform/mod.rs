//! Platform capabilities consumed by the accessory server.
//!
//! The core performs no I/O of its own. Everything platform-specific is expressed as a small
//! trait here and handed in at server start through a [`Platform`] bundle. The associated-type
//! [`PlatformConfig`] ties the concrete capability types together, so that the server and the
//! pairing engines can be generic over one parameter instead of four.
//!
//! [`Platform`]: struct.Platform.html
//! [`PlatformConfig`]: trait.PlatformConfig.html

use crate::time::Instant;
use crate::HapError;
use rand_core::{CryptoRng, RngCore};

/// A storage domain of the key-value store.
///
/// Domains are purged independently; `restore factory settings` purges all three.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Domain {
    /// Device identity, auth-attempt counter, GSN/CN, broadcast key.
    Configuration = 0x00,
    /// One key per pairing slot.
    Pairings = 0x10,
    /// Per-accessory broadcast configuration records.
    CharacteristicConfiguration = 0x20,
}

/// Keys used within [`Domain::Configuration`].
pub mod config_key {
    /// 6-byte device id.
    pub const DEVICE_ID: u8 = 0x00;
    /// 32-byte Ed25519 long-term secret key.
    pub const LONG_TERM_SECRET_KEY: u8 = 0x01;
    /// Configuration number (CN), 4 bytes little-endian.
    pub const CONFIGURATION_NUMBER: u8 = 0x02;
    /// Consecutive failed Pair Setup attempts, 1 byte.
    pub const UNSUCCESSFUL_AUTH_ATTEMPTS: u8 = 0x03;
    /// BLE Global State Number (GSN), 2 bytes little-endian.
    pub const GLOBAL_STATE_NUMBER: u8 = 0x04;
    /// 6-byte BLE accessory advertising identifier.
    pub const ADVERTISING_ID: u8 = 0x05;
    /// 32-byte broadcast encryption key followed by its 2-byte expiration GSN.
    pub const BROADCAST_KEY: u8 = 0x06;
}

/// Largest value accepted by [`KeyValueStore::set`] implementations.
pub const MAX_VALUE_BYTES: usize = 512;

/// Durable key-value storage capability.
///
/// Domains and keys are 8-bit, values are opaque blobs. Implementations report every failure as
/// [`HapError::Unknown`]; the core decides per call site whether that is fatal.
pub trait KeyValueStore {
    /// Reads the value stored under `(domain, key)` into `buf`.
    ///
    /// Returns `None` when the key does not exist. Values longer than `buf` are reported as
    /// `Unknown` (store corruption, since the core never writes values it could not read back).
    fn get<'a>(
        &self,
        domain: Domain,
        key: u8,
        buf: &'a mut [u8],
    ) -> Result<Option<&'a [u8]>, HapError>;

    /// Stores `value` under `(domain, key)`, replacing any previous value.
    fn set(&mut self, domain: Domain, key: u8, value: &[u8]) -> Result<(), HapError>;

    /// Removes the value stored under `(domain, key)`. Removing a missing key succeeds.
    fn remove(&mut self, domain: Domain, key: u8) -> Result<(), HapError>;

    /// Calls `f` with every key present in `domain`, in unspecified order, until `f` returns
    /// `false` or fails.
    fn enumerate(
        &self,
        domain: Domain,
        f: &mut dyn FnMut(u8) -> Result<bool, HapError>,
    ) -> Result<(), HapError>;

    /// Removes every key in `domain`.
    fn purge_domain(&mut self, domain: Domain) -> Result<(), HapError>;
}

/// Monotonic millisecond clock capability.
///
/// Only differences between two readings are meaningful; the epoch is unspecified and does not
/// survive reboots.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Apple Authentication Coprocessor capability, required for Pair Setup with Auth.
pub trait AuthCoprocessor {
    /// Copies the accessory certificate into `buf`, returning the number of bytes written.
    fn copy_certificate(&self, buf: &mut [u8]) -> Result<usize, HapError>;

    /// Signs the challenge, writing the signature into `buf` and returning its length.
    fn create_signature(&self, challenge: &[u8], buf: &mut [u8]) -> Result<usize, HapError>;
}

/// Placeholder for accessories without an Apple Authentication Coprocessor.
///
/// Pair Setup with Auth fails with `InvalidState` when this is the configured coprocessor type
/// and no instance is present.
pub struct NoAuthCoprocessor;

impl AuthCoprocessor for NoAuthCoprocessor {
    fn copy_certificate(&self, _buf: &mut [u8]) -> Result<usize, HapError> {
        Err(HapError::InvalidState)
    }

    fn create_signature(&self, _challenge: &[u8], _buf: &mut [u8]) -> Result<usize, HapError> {
        Err(HapError::InvalidState)
    }
}

/// Trait tying together the platform capability types for one deployment.
///
/// Every application defines a type implementing this trait and supplies it to the accessory
/// server.
pub trait PlatformConfig {
    /// Durable key-value storage.
    type Store: KeyValueStore;

    /// Cryptographically secure random number source.
    type Rng: RngCore + CryptoRng;

    /// Monotonic millisecond clock.
    type Clock: Clock;

    /// Apple Authentication Coprocessor; use [`NoAuthCoprocessor`] when absent.
    ///
    /// [`NoAuthCoprocessor`]: struct.NoAuthCoprocessor.html
    type Auth: AuthCoprocessor;
}

/// The capability instances handed to the server at start.
pub struct Platform<C: PlatformConfig> {
    pub store: C::Store,
    pub rng: C::Rng,
    pub clock: C::Clock,
    /// `None` on accessories without a coprocessor.
    pub auth: Option<C::Auth>,
}
