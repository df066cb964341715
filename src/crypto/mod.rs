//! Uniform contracts over the cryptographic primitives used by pairing and session encryption.
//!
//! HAP uses SRP-6a for Pair Setup, X25519 + Ed25519 for Pair Verify, HKDF-SHA-512 for every key
//! derivation, and ChaCha20-Poly1305 for everything encrypted. This module wraps the ecosystem
//! implementations behind the exact byte-oriented operations the pairing engines need, so that
//! the engines never touch a crate API directly.
//!
//! All operations are total functions of their inputs; randomness is a capability passed in by
//! the caller (see [`platform`]).
//!
//! [`platform`]: ../platform/index.html

pub mod srp;

use crate::HapError;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, NewAead};
use chacha20poly1305::{ChaCha20Poly1305, Key};
use core::convert::TryFrom;
use ed25519_dalek::{ExpandedSecretKey, PublicKey, SecretKey, Signature, Verifier};
use hkdf::Hkdf;
use sha2::Sha512;

pub const CHACHA20_POLY1305_KEY_BYTES: usize = 32;
pub const CHACHA20_POLY1305_TAG_BYTES: usize = 16;
pub const CHACHA20_POLY1305_NONCE_BYTES: usize = 12;
pub const X25519_BYTES: usize = 32;
pub const X25519_SCALAR_BYTES: usize = 32;
pub const ED25519_PUBLIC_KEY_BYTES: usize = 32;
pub const ED25519_SECRET_KEY_BYTES: usize = 32;
pub const ED25519_BYTES: usize = 64;

/// Derives `okm.len()` bytes from `ikm` with HKDF-SHA-512.
pub fn hkdf_sha512(okm: &mut [u8], ikm: &[u8], salt: &[u8], info: &[u8]) {
    Hkdf::<Sha512>::new(Some(salt), ikm)
        .expand(info, okm)
        .expect("HKDF output length out of range");
}

/// Builds a nonce from an 8-character ASCII label, placed in the lower 8 bytes with the leading
/// 4 bytes zero.
///
/// Used by the pairing messages (`"PS-Msg05"`, `"PV-Msg02"`, ...).
pub fn nonce_from_label(label: &[u8; 8]) -> [u8; CHACHA20_POLY1305_NONCE_BYTES] {
    let mut nonce = [0; CHACHA20_POLY1305_NONCE_BYTES];
    nonce[4..].copy_from_slice(label);
    nonce
}

/// Builds a nonce from a 64-bit message counter, little-endian in the lower 8 bytes.
///
/// Used by the per-session control channels.
pub fn nonce_from_counter(counter: u64) -> [u8; CHACHA20_POLY1305_NONCE_BYTES] {
    let mut nonce = [0; CHACHA20_POLY1305_NONCE_BYTES];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypts `buf` in place and returns the 16-byte authentication tag.
pub fn chacha20_poly1305_encrypt(
    key: &[u8; CHACHA20_POLY1305_KEY_BYTES],
    nonce: &[u8; CHACHA20_POLY1305_NONCE_BYTES],
    aad: &[u8],
    buf: &mut [u8],
) -> [u8; CHACHA20_POLY1305_TAG_BYTES] {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)
        .expect("ChaCha20-Poly1305 encryption cannot fail on in-bounds input");
    tag.into()
}

/// Decrypts `buf` in place, verifying the detached tag.
///
/// On tag mismatch the buffer contents are unspecified and must not be used.
pub fn chacha20_poly1305_decrypt(
    key: &[u8; CHACHA20_POLY1305_KEY_BYTES],
    nonce: &[u8; CHACHA20_POLY1305_NONCE_BYTES],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8; CHACHA20_POLY1305_TAG_BYTES],
) -> Result<(), HapError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buf,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| HapError::Authentication)
}

/// Returns the Ed25519 public key belonging to a 32-byte secret key.
pub fn ed25519_public_key(sk: &[u8; ED25519_SECRET_KEY_BYTES]) -> [u8; ED25519_PUBLIC_KEY_BYTES] {
    let secret = SecretKey::from_bytes(sk).expect("32-byte Ed25519 secret key");
    PublicKey::from(&secret).to_bytes()
}

/// Signs `message` with the given Ed25519 key pair.
pub fn ed25519_sign(
    sk: &[u8; ED25519_SECRET_KEY_BYTES],
    pk: &[u8; ED25519_PUBLIC_KEY_BYTES],
    message: &[u8],
) -> [u8; ED25519_BYTES] {
    let secret = SecretKey::from_bytes(sk).expect("32-byte Ed25519 secret key");
    let public = PublicKey::from_bytes(pk).expect("32-byte Ed25519 public key");
    ExpandedSecretKey::from(&secret).sign(message, &public).to_bytes()
}

/// Verifies an Ed25519 signature over `message`.
pub fn ed25519_verify(
    pk: &[u8; ED25519_PUBLIC_KEY_BYTES],
    message: &[u8],
    signature: &[u8; ED25519_BYTES],
) -> Result<(), HapError> {
    let public = PublicKey::from_bytes(pk).map_err(|_| HapError::Authentication)?;
    let signature = Signature::try_from(&signature[..]).map_err(|_| HapError::Authentication)?;
    public
        .verify(message, &signature)
        .map_err(|_| HapError::Authentication)
}

/// Computes the X25519 public key for a 32-byte scalar.
pub fn x25519_scalarmult_base(sk: &[u8; X25519_SCALAR_BYTES]) -> [u8; X25519_BYTES] {
    let secret = x25519_dalek::StaticSecret::from(*sk);
    x25519_dalek::PublicKey::from(&secret).to_bytes()
}

/// Computes the X25519 shared secret between a scalar and a foreign public key.
pub fn x25519_scalarmult(
    sk: &[u8; X25519_SCALAR_BYTES],
    pk: &[u8; X25519_BYTES],
) -> [u8; X25519_BYTES] {
    let secret = x25519_dalek::StaticSecret::from(*sk);
    let public = x25519_dalek::PublicKey::from(*pk);
    *secret.diffie_hellman(&public).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_layout() {
        let nonce = nonce_from_label(b"PS-Msg05");
        assert_eq!(&nonce[..4], &[0; 4]);
        assert_eq!(&nonce[4..], b"PS-Msg05");

        let nonce = nonce_from_counter(1);
        assert_eq!(nonce, [0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn aead_round_trip_and_tamper() {
        let key = [7; 32];
        let nonce = nonce_from_counter(0);
        let mut buf = *b"accessory data";
        let tag = chacha20_poly1305_encrypt(&key, &nonce, &[], &mut buf);
        assert_ne!(&buf, b"accessory data");

        chacha20_poly1305_decrypt(&key, &nonce, &[], &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"accessory data");

        let mut tampered = buf;
        let bad_tag = {
            let mut t = tag;
            t[0] ^= 1;
            t
        };
        assert_eq!(
            chacha20_poly1305_decrypt(&key, &nonce, &[], &mut tampered, &bad_tag),
            Err(HapError::Authentication)
        );
    }

    #[test]
    fn aead_aad_is_authenticated() {
        let key = [1; 32];
        let nonce = nonce_from_counter(3);
        let mut buf = [0x55; 16];
        let tag = chacha20_poly1305_encrypt(&key, &nonce, &[16, 0], &mut buf);
        assert!(chacha20_poly1305_decrypt(&key, &nonce, &[0, 0], &mut buf, &tag).is_err());
    }

    #[test]
    fn ed25519_sign_verify() {
        let sk = [3; 32];
        let pk = ed25519_public_key(&sk);
        let sig = ed25519_sign(&sk, &pk, b"device info");
        ed25519_verify(&pk, b"device info", &sig).unwrap();
        assert!(ed25519_verify(&pk, b"device inf0", &sig).is_err());
    }

    #[test]
    fn x25519_agreement() {
        let a = [11; 32];
        let b = [22; 32];
        let a_pub = x25519_scalarmult_base(&a);
        let b_pub = x25519_scalarmult_base(&b);
        assert_eq!(x25519_scalarmult(&a, &b_pub), x25519_scalarmult(&b, &a_pub));
    }
}
