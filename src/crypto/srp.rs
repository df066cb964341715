//! SRP-6a (RFC 5054) with the 3072-bit group and SHA-512, as used by Pair Setup.
//!
//! The accessory is always the SRP server: it holds the verifier derived from the setup code and
//! never learns the code from the controller. The RustCrypto `srp` crate computes a simplified
//! client proof and cannot interoperate with HAP controllers, so the group arithmetic lives here,
//! on top of `num-bigint`.
//!
//! All big-endian byte parameters are fixed width: public keys, premaster secrets and the
//! verifier are zero-padded to the 384-byte group size. Stripping leading zeros for the wire is
//! the caller's concern.

use num_bigint::BigUint;
use num_traits::Zero;
use sha2::{Digest, Sha512};

/// Size of the group prime `N`; also the size of public keys, the verifier and the premaster
/// secret.
pub const PRIME_BYTES: usize = 384;
/// Size of an SRP proof (`M1`/`M2`) and of the scrambling parameter digest.
pub const PROOF_BYTES: usize = 64;
/// Size of the session key `K = H(S)`.
pub const SESSION_KEY_BYTES: usize = 64;
/// Size of the accessory's ephemeral secret `b`.
pub const SECRET_KEY_BYTES: usize = 32;
/// Size of the user salt.
pub const SALT_BYTES: usize = 16;

/// The SRP user name fixed by the pairing protocol.
pub const USERNAME: &[u8] = b"Pair-Setup";

/// 3072-bit MODP group prime from RFC 5054, big-endian.
const N_3072: [u8; PRIME_BYTES] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2,
    0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67,
    0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E,
    0x34, 0x04, 0xDD, 0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5,
    0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF,
    0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED, 0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE,
    0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE4, 0x5B, 0x3D,
    0xC2, 0x00, 0x7C, 0xB8, 0xA1, 0x63, 0xBF, 0x05, 0x98, 0xDA, 0x48, 0x36, 0x1C, 0x55, 0xD3,
    0x9A, 0x69, 0x16, 0x3F, 0xA8, 0xFD, 0x24, 0xCF, 0x5F, 0x83, 0x65, 0x5D, 0x23, 0xDC, 0xA3,
    0xAD, 0x96, 0x1C, 0x62, 0xF3, 0x56, 0x20, 0x85, 0x52, 0xBB, 0x9E, 0xD5, 0x29, 0x07, 0x70,
    0x96, 0x96, 0x6D, 0x67, 0x0C, 0x35, 0x4E, 0x4A, 0xBC, 0x98, 0x04, 0xF1, 0x74, 0x6C, 0x08,
    0xCA, 0x18, 0x21, 0x7C, 0x32, 0x90, 0x5E, 0x46, 0x2E, 0x36, 0xCE, 0x3B, 0xE3, 0x9E, 0x77,
    0x2C, 0x18, 0x0E, 0x86, 0x03, 0x9B, 0x27, 0x83, 0xA2, 0xEC, 0x07, 0xA2, 0x8F, 0xB5, 0xC5,
    0x5D, 0xF0, 0x6F, 0x4C, 0x52, 0xC9, 0xDE, 0x2B, 0xCB, 0xF6, 0x95, 0x58, 0x17, 0x18, 0x39,
    0x95, 0x49, 0x7C, 0xEA, 0x95, 0x6A, 0xE5, 0x15, 0xD2, 0x26, 0x18, 0x98, 0xFA, 0x05, 0x10,
    0x15, 0x72, 0x8E, 0x5A, 0x8A, 0xAA, 0xC4, 0x2D, 0xAD, 0x33, 0x17, 0x0D, 0x04, 0x50, 0x7A,
    0x33, 0xA8, 0x55, 0x21, 0xAB, 0xDF, 0x1C, 0xBA, 0x64, 0xEC, 0xFB, 0x85, 0x04, 0x58, 0xDB,
    0xEF, 0x0A, 0x8A, 0xEA, 0x71, 0x57, 0x5D, 0x06, 0x0C, 0x7D, 0xB3, 0x97, 0x0F, 0x85, 0xA6,
    0xE1, 0xE4, 0xC7, 0xAB, 0xF5, 0xAE, 0x8C, 0xDB, 0x09, 0x33, 0xD7, 0x1E, 0x8C, 0x94, 0xE0,
    0x4A, 0x25, 0x61, 0x9D, 0xCE, 0xE3, 0xD2, 0x26, 0x1A, 0xD2, 0xEE, 0x6B, 0xF1, 0x2F, 0xFA,
    0x06, 0xD9, 0x8A, 0x08, 0x64, 0xD8, 0x76, 0x02, 0x73, 0x3E, 0xC8, 0x6A, 0x64, 0x52, 0x1F,
    0x2B, 0x18, 0x17, 0x7B, 0x20, 0x0C, 0xBB, 0xE1, 0x17, 0x57, 0x7A, 0x61, 0x5D, 0x6C, 0x77,
    0x09, 0x88, 0xC0, 0xBA, 0xD9, 0x46, 0xE2, 0x08, 0xE2, 0x4F, 0xA0, 0x74, 0xE5, 0xAB, 0x31,
    0x43, 0xDB, 0x5B, 0xFC, 0xE0, 0xFD, 0x10, 0x8E, 0x4B, 0x82, 0xD1, 0x20, 0xA9, 0x3A, 0xD2,
    0xCA, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Group generator.
const G: u32 = 5;

/// The controller presented a public key `A` with `A mod N == 0`; authentication must fail.
#[derive(Debug, PartialEq, Eq)]
pub struct IllegalPublicKey;

fn n() -> BigUint {
    BigUint::from_bytes_be(&N_3072)
}

fn g() -> BigUint {
    BigUint::from(G)
}

/// Writes `value` big-endian into `out`, left-padded with zeros.
///
/// Panics when the value does not fit; all values handled here are reduced mod `N` first.
fn to_be_padded(value: &BigUint, out: &mut [u8]) {
    let bytes = value.to_bytes_be();
    assert!(bytes.len() <= out.len(), "SRP value wider than group size");
    let offset = out.len() - bytes.len();
    out[..offset].iter_mut().for_each(|b| *b = 0);
    out[offset..].copy_from_slice(&bytes);
}

/// `k = H(N | PAD(g))`, the SRP-6a multiplier parameter.
fn multiplier() -> BigUint {
    let mut padded_g = [0; PRIME_BYTES];
    to_be_padded(&g(), &mut padded_g);
    let mut hasher = Sha512::new();
    hasher.update(&N_3072[..]);
    hasher.update(&padded_g[..]);
    BigUint::from_bytes_be(hasher.finalize().as_slice())
}

/// `x = H(salt | H(username ":" password))`, the private key derived from the setup code.
fn private_key(username: &[u8], password: &[u8], salt: &[u8; SALT_BYTES]) -> BigUint {
    let mut inner = Sha512::new();
    inner.update(username);
    inner.update(b":");
    inner.update(password);
    let identity = inner.finalize();

    let mut outer = Sha512::new();
    outer.update(&salt[..]);
    outer.update(identity.as_slice());
    BigUint::from_bytes_be(outer.finalize().as_slice())
}

/// Derives the password verifier `v = g^x mod N` for the given user identity.
pub fn verifier(
    username: &[u8],
    password: &[u8],
    salt: &[u8; SALT_BYTES],
) -> [u8; PRIME_BYTES] {
    let x = private_key(username, password, salt);
    let v = g().modpow(&x, &n());
    let mut out = [0; PRIME_BYTES];
    to_be_padded(&v, &mut out);
    out
}

/// Computes the server public key `B = k*v + g^b mod N`.
pub fn public_key(b: &[u8; SECRET_KEY_BYTES], verifier: &[u8; PRIME_BYTES]) -> [u8; PRIME_BYTES] {
    let n = n();
    let v = BigUint::from_bytes_be(verifier);
    let b = BigUint::from_bytes_be(b);
    let big_b = (multiplier() * v + g().modpow(&b, &n)) % &n;
    let mut out = [0; PRIME_BYTES];
    to_be_padded(&big_b, &mut out);
    out
}

/// Computes the scrambling parameter `u = H(PAD(A) | PAD(B))`.
pub fn scrambling_parameter(
    a_pub: &[u8; PRIME_BYTES],
    b_pub: &[u8; PRIME_BYTES],
) -> [u8; PROOF_BYTES] {
    let mut hasher = Sha512::new();
    hasher.update(&a_pub[..]);
    hasher.update(&b_pub[..]);
    let mut out = [0; PROOF_BYTES];
    out.copy_from_slice(hasher.finalize().as_slice());
    out
}

/// Computes the premaster secret `S = (A * v^u)^b mod N`.
///
/// Fails when `A mod N == 0`, which would let a rogue controller force a known secret.
pub fn premaster_secret(
    a_pub: &[u8; PRIME_BYTES],
    b: &[u8; SECRET_KEY_BYTES],
    u: &[u8; PROOF_BYTES],
    verifier: &[u8; PRIME_BYTES],
) -> Result<[u8; PRIME_BYTES], IllegalPublicKey> {
    let n = n();
    let a = BigUint::from_bytes_be(a_pub) % &n;
    if a.is_zero() {
        return Err(IllegalPublicKey);
    }
    let u = BigUint::from_bytes_be(u);
    let v = BigUint::from_bytes_be(verifier);
    let b = BigUint::from_bytes_be(b);
    let s = (a * v.modpow(&u, &n)).modpow(&b, &n);
    let mut out = [0; PRIME_BYTES];
    to_be_padded(&s, &mut out);
    Ok(out)
}

/// Derives the session key `K = H(S)`.
pub fn session_key(s: &[u8; PRIME_BYTES]) -> [u8; SESSION_KEY_BYTES] {
    let mut hasher = Sha512::new();
    hasher.update(&s[..]);
    let mut out = [0; SESSION_KEY_BYTES];
    out.copy_from_slice(hasher.finalize().as_slice());
    out
}

/// Computes the expected controller proof
/// `M1 = H((H(N) xor H(g)) | H(username) | salt | PAD(A) | PAD(B) | K)`.
pub fn proof_m1(
    username: &[u8],
    salt: &[u8; SALT_BYTES],
    a_pub: &[u8; PRIME_BYTES],
    b_pub: &[u8; PRIME_BYTES],
    k: &[u8; SESSION_KEY_BYTES],
) -> [u8; PROOF_BYTES] {
    let hn = Sha512::digest(&N_3072[..]);
    let mut padded_g = [0; PRIME_BYTES];
    to_be_padded(&g(), &mut padded_g);
    let hg = Sha512::digest(&padded_g[..]);
    let mut hng = [0; PROOF_BYTES];
    for i in 0..PROOF_BYTES {
        hng[i] = hn[i] ^ hg[i];
    }

    let mut hasher = Sha512::new();
    hasher.update(&hng[..]);
    hasher.update(Sha512::digest(username).as_slice());
    hasher.update(&salt[..]);
    hasher.update(&a_pub[..]);
    hasher.update(&b_pub[..]);
    hasher.update(&k[..]);
    let mut out = [0; PROOF_BYTES];
    out.copy_from_slice(hasher.finalize().as_slice());
    out
}

/// Computes the accessory proof `M2 = H(PAD(A) | M1 | K)`.
pub fn proof_m2(
    a_pub: &[u8; PRIME_BYTES],
    m1: &[u8; PROOF_BYTES],
    k: &[u8; SESSION_KEY_BYTES],
) -> [u8; PROOF_BYTES] {
    let mut hasher = Sha512::new();
    hasher.update(&a_pub[..]);
    hasher.update(&m1[..]);
    hasher.update(&k[..]);
    let mut out = [0; PROOF_BYTES];
    out.copy_from_slice(hasher.finalize().as_slice());
    out
}

/// Strips the leading zero bytes of a fixed-width public key for the wire.
pub fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}
