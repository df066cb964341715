//! An embedded HomeKit Accessory Protocol (HAP) server core.
//!
//! This crate implements the security and transport state machines that let a
//! HomeKit controller pair with, authenticate, and exchange characteristic
//! data with an accessory, over either an IP transport or Bluetooth Low
//! Energy with the GATT-based HAP PDU protocol.
//!
//! # Using the core
//!
//! The core is runtime and hardware-agnostic: It does not perform any I/O of
//! its own and provides capability interfaces that need to be implemented
//! once for every supported platform. You have to provide it with a few
//! platform-specific services:
//! * A persistent [`KeyValueStore`] for pairings, identity and configuration.
//! * A cryptographically secure random number generator (any
//!   [`rand_core::RngCore`]` + `[`rand_core::CryptoRng`]).
//! * A millisecond-precision monotonic [`Clock`].
//!
//! The concrete GATT peripheral, TCP listener and advertising publisher stay
//! outside; they feed received bytes into the [`ble`] transaction engine or
//! [`ip`] record layer and carry the produced responses back to the wire.
//!
//! [`KeyValueStore`]: platform/trait.KeyValueStore.html
//! [`Clock`]: platform/trait.Clock.html
//! [`rand_core::RngCore`]: https://docs.rs/rand_core
//! [`rand_core::CryptoRng`]: https://docs.rs/rand_core
//! [`ble`]: ble/index.html
//! [`ip`]: ip/index.html

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod accessory;
pub mod ble;
pub mod bytes;
pub mod characteristic;
pub mod crypto;
mod error;
pub mod event;
pub mod ip;
pub mod pairing;
pub mod platform;
pub mod server;
pub mod session;
pub mod time;
pub mod tlv;
pub mod uuid;

pub use self::error::{Error, HapError};

/// Version of the HomeKit Accessory Protocol implemented by this crate.
pub const HAP_PROTOCOL_VERSION: &str = "2.2.0";
