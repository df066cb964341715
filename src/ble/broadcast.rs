//! BLE broadcast notifications: per-characteristic intervals and the broadcast encryption key.
//!
//! Broadcasted events let a controller decrypt characteristic values from advertisements while
//! disconnected. The configuration lives in one key-value record per accessory, an ordered list
//! of `(characteristic iid, interval)` entries. The broadcast encryption key is derived from a
//! verified session's shared secret and carries the GSN at which it expires.

use rand_core::{CryptoRng, RngCore};

use crate::bytes::{ByteReader, ByteWriter};
use crate::crypto;
use crate::platform::{config_key, Domain, KeyValueStore};
use crate::HapError;

enum_with_unknown! {
    /// Broadcast interval codes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Interval(u8) {
        Ms20 = 0x01,
        Ms1280 = 0x02,
        Ms2560 = 0x03,
    }
}

impl Interval {
    pub fn is_valid(value: u8) -> bool {
        !matches!(Interval::from(value), Interval::Unknown(_))
    }

    pub fn millis(&self) -> u32 {
        match self {
            Interval::Ms20 => 20,
            Interval::Ms1280 => 1280,
            Interval::Ms2560 => 2560,
            Interval::Unknown(_) => 0,
        }
    }
}

/// Entries per accessory record; more enabled characteristics than this is a store failure.
pub const MAX_ENTRIES: usize = 42;

const ENTRY_BYTES: usize = 3;

/// The broadcast configuration of one accessory: iid-sorted `(iid, interval)` pairs.
pub struct Config {
    entries: [(u16, Interval); MAX_ENTRIES],
    len: usize,
}

impl Config {
    fn empty() -> Self {
        Config {
            entries: [(0, Interval::Ms20); MAX_ENTRIES],
            len: 0,
        }
    }

    /// Loads the configuration record of `aid`.
    pub fn load<S: KeyValueStore>(store: &S, aid: u64) -> Result<Self, HapError> {
        let mut buf = [0; MAX_ENTRIES * ENTRY_BYTES];
        let bytes = match store.get(
            Domain::CharacteristicConfiguration,
            record_key(aid),
            &mut buf,
        )? {
            None => return Ok(Self::empty()),
            Some(bytes) => bytes,
        };
        if bytes.len() % ENTRY_BYTES != 0 {
            return Err(HapError::Unknown);
        }

        let mut config = Self::empty();
        let mut reader = ByteReader::new(bytes);
        while !reader.is_empty() {
            let iid = reader.read_u16_le().map_err(|_| HapError::Unknown)?;
            let interval = reader.read_u8().map_err(|_| HapError::Unknown)?;
            if !Interval::is_valid(interval) {
                return Err(HapError::Unknown);
            }
            config.entries[config.len] = (iid, Interval::from(interval));
            config.len += 1;
        }
        Ok(config)
    }

    fn persist<S: KeyValueStore>(&self, store: &mut S, aid: u64) -> Result<(), HapError> {
        if self.len == 0 {
            return store.remove(Domain::CharacteristicConfiguration, record_key(aid));
        }
        let mut buf = [0; MAX_ENTRIES * ENTRY_BYTES];
        let mut writer = ByteWriter::new(&mut buf);
        for (iid, interval) in &self.entries[..self.len] {
            writer.write_u16_le(*iid).map_err(|_| HapError::Unknown)?;
            writer.write_u8(u8::from(*interval)).map_err(|_| HapError::Unknown)?;
        }
        store.set(
            Domain::CharacteristicConfiguration,
            record_key(aid),
            &buf[..self.len * ENTRY_BYTES],
        )
    }

    /// The configured interval for a characteristic, if broadcasts are enabled on it.
    pub fn interval_of(&self, iid: u16) -> Option<Interval> {
        self.entries[..self.len]
            .binary_search_by_key(&iid, |(i, _)| *i)
            .ok()
            .map(|index| self.entries[index].1)
    }
}

fn record_key(aid: u64) -> u8 {
    // One record per accessory; bridged accessories get distinct low-byte aids.
    aid as u8
}

/// Enables broadcasts for `(aid, iid)` at the given interval, keeping the record sorted.
pub fn enable<S: KeyValueStore>(
    store: &mut S,
    aid: u64,
    iid: u16,
    interval: Interval,
) -> Result<(), HapError> {
    let mut config = Config::load(store, aid)?;
    match config.entries[..config.len].binary_search_by_key(&iid, |(i, _)| *i) {
        Ok(index) => config.entries[index].1 = interval,
        Err(index) => {
            if config.len == MAX_ENTRIES {
                return Err(HapError::Unknown);
            }
            config.entries.copy_within(index..config.len, index + 1);
            config.entries[index] = (iid, interval);
            config.len += 1;
        }
    }
    config.persist(store, aid)
}

/// Disables broadcasts for `(aid, iid)`. Disabling an unconfigured characteristic is a no-op.
pub fn disable<S: KeyValueStore>(store: &mut S, aid: u64, iid: u16) -> Result<(), HapError> {
    let mut config = Config::load(store, aid)?;
    if let Ok(index) = config.entries[..config.len].binary_search_by_key(&iid, |(i, _)| *i) {
        config.entries.copy_within(index + 1..config.len, index);
        config.len -= 1;
        config.persist(store, aid)?;
    }
    Ok(())
}

/// Bytes in the broadcast encryption key.
pub const KEY_BYTES: usize = 32;

/// The broadcast encryption key and the GSN at which it expires.
pub struct Key {
    pub bytes: [u8; KEY_BYTES],
    pub expiration_gsn: u16,
}

/// Derives and persists a fresh broadcast encryption key from a session's Pair Verify shared
/// secret.
///
/// The key stays valid for 32767 state number increments from `current_gsn`.
pub fn generate_key<S: KeyValueStore>(
    store: &mut S,
    shared_secret: &[u8; 32],
    advertising_id: &[u8; 6],
    current_gsn: u16,
) -> Result<Key, HapError> {
    let mut bytes = [0; KEY_BYTES];
    crypto::hkdf_sha512(
        &mut bytes,
        shared_secret,
        advertising_id,
        b"Broadcast-Encryption-Key",
    );
    let expiration_gsn = current_gsn.wrapping_add(32767);

    let mut record = [0; KEY_BYTES + 2];
    record[..KEY_BYTES].copy_from_slice(&bytes);
    record[KEY_BYTES..].copy_from_slice(&expiration_gsn.to_le_bytes());
    store.set(Domain::Configuration, config_key::BROADCAST_KEY, &record)?;

    Ok(Key {
        bytes,
        expiration_gsn,
    })
}

/// Loads the current broadcast key, if one has been generated and not expired.
pub fn key<S: KeyValueStore>(store: &S) -> Result<Option<Key>, HapError> {
    let mut buf = [0; KEY_BYTES + 2];
    match store.get(Domain::Configuration, config_key::BROADCAST_KEY, &mut buf)? {
        None => Ok(None),
        Some(record) if record.len() == KEY_BYTES + 2 => {
            let mut bytes = [0; KEY_BYTES];
            bytes.copy_from_slice(&record[..KEY_BYTES]);
            let expiration_gsn = u16::from_le_bytes([record[KEY_BYTES], record[KEY_BYTES + 1]]);
            Ok(Some(Key {
                bytes,
                expiration_gsn,
            }))
        }
        Some(_) => Err(HapError::Unknown),
    }
}

/// Drops the broadcast key (factory reset, firmware update, explicit expiration).
pub fn expire_key<S: KeyValueStore>(store: &mut S) -> Result<(), HapError> {
    store.remove(Domain::Configuration, config_key::BROADCAST_KEY)
}

/// Fills the advertising identifier, creating it on first use.
pub fn advertising_id<S: KeyValueStore, R: RngCore + CryptoRng>(
    store: &mut S,
    rng: &mut R,
) -> Result<[u8; 6], HapError> {
    let mut buf = [0; 6];
    match store.get(Domain::Configuration, config_key::ADVERTISING_ID, &mut buf)? {
        Some(bytes) if bytes.len() == 6 => Ok(buf),
        Some(_) => Err(HapError::Unknown),
        None => {
            rng.fill_bytes(&mut buf);
            store.set(Domain::Configuration, config_key::ADVERTISING_ID, &buf)?;
            Ok(buf)
        }
    }
}

/// Overwrites the advertising identifier (Protocol-Configuration request 0x03).
pub fn set_advertising_id<S: KeyValueStore>(store: &mut S, id: &[u8; 6]) -> Result<(), HapError> {
    store.set(Domain::Configuration, config_key::ADVERTISING_ID, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::{MemoryStore, TestRng};

    #[test]
    fn config_round_trip() {
        let mut store = MemoryStore::new();
        enable(&mut store, 1, 13, Interval::Ms1280).unwrap();

        let config = Config::load(&store, 1).unwrap();
        assert_eq!(config.interval_of(13), Some(Interval::Ms1280));
        assert_eq!(config.interval_of(14), None);

        disable(&mut store, 1, 13).unwrap();
        let config = Config::load(&store, 1).unwrap();
        assert_eq!(config.interval_of(13), None);
    }

    #[test]
    fn entries_stay_sorted() {
        let mut store = MemoryStore::new();
        enable(&mut store, 1, 30, Interval::Ms20).unwrap();
        enable(&mut store, 1, 10, Interval::Ms20).unwrap();
        enable(&mut store, 1, 20, Interval::Ms2560).unwrap();

        let config = Config::load(&store, 1).unwrap();
        let iids: Vec<u16> = config.entries[..config.len].iter().map(|(i, _)| *i).collect();
        assert_eq!(iids, vec![10, 20, 30]);

        // Re-enabling updates in place.
        enable(&mut store, 1, 20, Interval::Ms1280).unwrap();
        let config = Config::load(&store, 1).unwrap();
        assert_eq!(config.len, 3);
        assert_eq!(config.interval_of(20), Some(Interval::Ms1280));
    }

    #[test]
    fn record_is_bounded() {
        let mut store = MemoryStore::new();
        for iid in 0..MAX_ENTRIES as u16 {
            enable(&mut store, 1, iid, Interval::Ms20).unwrap();
        }
        assert_eq!(
            enable(&mut store, 1, 999, Interval::Ms20),
            Err(HapError::Unknown)
        );
    }

    #[test]
    fn key_lifecycle() {
        let mut store = MemoryStore::new();
        assert!(key(&store).unwrap().is_none());

        let generated = generate_key(&mut store, &[7; 32], &[1, 2, 3, 4, 5, 6], 100).unwrap();
        let loaded = key(&store).unwrap().unwrap();
        assert_eq!(loaded.bytes, generated.bytes);
        assert_eq!(loaded.expiration_gsn, 100 + 32767);

        // Deterministic in its inputs.
        let again = generate_key(&mut store, &[7; 32], &[1, 2, 3, 4, 5, 6], 100).unwrap();
        assert_eq!(again.bytes, generated.bytes);
        let other = generate_key(&mut store, &[8; 32], &[1, 2, 3, 4, 5, 6], 100).unwrap();
        assert_ne!(other.bytes, generated.bytes);

        expire_key(&mut store).unwrap();
        assert!(key(&store).unwrap().is_none());
    }

    #[test]
    fn advertising_id_is_stable() {
        let mut store = MemoryStore::new();
        let mut rng = TestRng(5);
        let first = advertising_id(&mut store, &mut rng).unwrap();
        let second = advertising_id(&mut store, &mut rng).unwrap();
        assert_eq!(first, second);

        set_advertising_id(&mut store, &[9; 6]).unwrap();
        assert_eq!(advertising_id(&mut store, &mut rng).unwrap(), [9; 6]);
    }
}
