//! Accessory identity: the process-wide Ed25519 long-term key pair and device identifier.
//!
//! Both are materialized lazily on first access and persisted in the `Configuration` domain.
//! The device id doubles as the accessory's pairing identifier (in `AA:BB:CC:DD:EE:FF` string
//! form) and as the base of the BLE device address. It is erased only by a factory reset, which
//! makes the accessory advertise as a brand-new device.

pub mod setup;

use crate::platform::{config_key, Domain, KeyValueStore};
use crate::{crypto, HapError};
use core::fmt;
use rand_core::{CryptoRng, RngCore};

/// Number of bytes in a device identifier.
pub const DEVICE_ID_BYTES: usize = 6;

/// Length of the `AA:BB:CC:DD:EE:FF` string form.
pub const DEVICE_ID_STRING_BYTES: usize = 17;

/// The 6-byte device identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceId(pub [u8; DEVICE_ID_BYTES]);

impl DeviceId {
    /// Formats the identifier as the 17-byte ASCII string used as the accessory's pairing
    /// identifier and advertised device name suffix.
    pub fn to_string_bytes(&self) -> [u8; DEVICE_ID_STRING_BYTES] {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut out = [b':'; DEVICE_ID_STRING_BYTES];
        for (i, byte) in self.0.iter().enumerate() {
            out[i * 3] = HEX[usize::from(byte >> 4)];
            out[i * 3 + 1] = HEX[usize::from(byte & 0xF)];
        }
        out
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.to_string_bytes();
        f.write_str(core::str::from_utf8(&s).unwrap())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

enum_with_unknown! {
    /// Accessory category, shown by controllers during setup and encoded into the setup payload.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Category(u16) {
        Other = 1,
        Bridge = 2,
        Fan = 3,
        GarageDoorOpener = 4,
        Lightbulb = 5,
        DoorLock = 6,
        Outlet = 7,
        Switch = 8,
        Thermostat = 9,
        Sensor = 10,
        SecuritySystem = 11,
        Door = 12,
        Window = 13,
        WindowCovering = 14,
        ProgrammableSwitch = 15,
        RangeExtender = 16,
        IpCamera = 17,
        VideoDoorbell = 18,
        AirPurifier = 19,
        Heater = 20,
        AirConditioner = 21,
        Humidifier = 22,
        Dehumidifier = 23,
        Sprinkler = 28,
        Faucet = 29,
        ShowerSystem = 30,
    }
}

/// The accessory's long-term identity.
pub struct Identity {
    pub ed_ltsk: [u8; crypto::ED25519_SECRET_KEY_BYTES],
    pub ed_ltpk: [u8; crypto::ED25519_PUBLIC_KEY_BYTES],
    pub device_id: DeviceId,
}

impl core::fmt::Debug for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Identity")
            .field("ed_ltsk", &"<redacted>")
            .field("ed_ltpk", &self.ed_ltpk)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl Identity {
    /// Loads the identity from the store, generating and persisting it on first access.
    pub fn load_or_generate<S, R>(store: &mut S, rng: &mut R) -> Result<Self, HapError>
    where
        S: KeyValueStore,
        R: RngCore + CryptoRng,
    {
        let device_id = {
            let mut buf = [0; DEVICE_ID_BYTES];
            let found = store
                .get(Domain::Configuration, config_key::DEVICE_ID, &mut buf)?
                .map(|b| b.len());
            match found {
                Some(DEVICE_ID_BYTES) => DeviceId(buf),
                Some(_) => return Err(HapError::Unknown),
                None => {
                    rng.fill_bytes(&mut buf);
                    store.set(Domain::Configuration, config_key::DEVICE_ID, &buf)?;
                    info!("generated new device id");
                    DeviceId(buf)
                }
            }
        };

        let ed_ltsk = {
            let mut buf = [0; crypto::ED25519_SECRET_KEY_BYTES];
            let found = store
                .get(Domain::Configuration, config_key::LONG_TERM_SECRET_KEY, &mut buf)?
                .map(|b| b.len());
            match found {
                Some(crypto::ED25519_SECRET_KEY_BYTES) => buf,
                Some(_) => return Err(HapError::Unknown),
                None => {
                    rng.fill_bytes(&mut buf);
                    store.set(Domain::Configuration, config_key::LONG_TERM_SECRET_KEY, &buf)?;
                    buf
                }
            }
        };

        let ed_ltpk = crypto::ed25519_public_key(&ed_ltsk);
        Ok(Identity {
            ed_ltsk,
            ed_ltpk,
            device_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::{MemoryStore, TestRng};

    #[test]
    fn device_id_string_form() {
        let id = DeviceId([0xAA, 0x01, 0x23, 0xCD, 0xEF, 0x00]);
        assert_eq!(&id.to_string_bytes(), b"AA:01:23:CD:EF:00");
    }

    #[test]
    fn identity_is_stable_across_loads() {
        let mut store = MemoryStore::new();
        let mut rng = TestRng(7);
        let first = Identity::load_or_generate(&mut store, &mut rng).unwrap();
        let second = Identity::load_or_generate(&mut store, &mut rng).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.ed_ltsk, second.ed_ltsk);
        assert_eq!(first.ed_ltpk, second.ed_ltpk);
        assert_eq!(first.ed_ltpk, crypto::ed25519_public_key(&first.ed_ltsk));
    }

    #[test]
    fn corrupt_identity_is_rejected() {
        let mut store = MemoryStore::new();
        let mut rng = TestRng(7);
        store
            .set(Domain::Configuration, config_key::DEVICE_ID, &[1, 2, 3])
            .unwrap();
        assert_eq!(
            Identity::load_or_generate(&mut store, &mut rng).unwrap_err(),
            HapError::Unknown
        );
    }
}
