//! Per-controller session state and transport encryption.
//!
//! A session exists from transport accept to disconnect. After Pair Verify (or transient Pair
//! Setup) it carries two directional ChaCha20-Poly1305 channels whose nonces are 64-bit
//! little-endian counters in the lower 8 bytes of the 12-byte nonce. The counters reset on
//! every (re-)verify and strictly increase within a session; an AEAD failure invalidates the
//! session on the spot.

use crate::crypto::{self, CHACHA20_POLY1305_KEY_BYTES, CHACHA20_POLY1305_TAG_BYTES};
use crate::pairing::{pair_setup, pair_verify};
use crate::utils::BitSet;
use crate::HapError;

/// Bytes backing the per-session subscription set (8 characteristics per byte).
pub const SUBSCRIPTION_SET_BYTES: usize = 32;

/// The transport a session arrived on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transport {
    Ip,
    Ble,
}

/// One direction of an encrypted control channel.
pub struct ControlChannel {
    key: [u8; CHACHA20_POLY1305_KEY_BYTES],
    nonce: u64,
}

impl ControlChannel {
    fn new(key: [u8; CHACHA20_POLY1305_KEY_BYTES]) -> Self {
        ControlChannel { key, nonce: 0 }
    }

    /// The next nonce counter value (for tests and diagnostics).
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], HapError> {
        let nonce = crypto::nonce_from_counter(self.nonce);
        // A u64 counter cannot realistically wrap, but reusing a nonce would break the AEAD;
        // treat wrap-around as a platform failure.
        self.nonce = self.nonce.checked_add(1).ok_or(HapError::Unknown)?;
        Ok(nonce)
    }

    fn encrypt(&mut self, aad: &[u8], buf: &mut [u8]) -> Result<[u8; 16], HapError> {
        let nonce = self.next_nonce()?;
        Ok(crypto::chacha20_poly1305_encrypt(&self.key, &nonce, aad, buf))
    }

    fn decrypt(
        &mut self,
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; CHACHA20_POLY1305_TAG_BYTES],
    ) -> Result<(), HapError> {
        let nonce = self.next_nonce()?;
        crypto::chacha20_poly1305_decrypt(&self.key, &nonce, aad, buf, tag)
    }
}

/// Per-controller connection state.
pub struct Session {
    pub transport: Transport,
    /// Set once the HAP session is open (post Pair Verify / transient Pair Setup).
    active: bool,
    /// Established via transient Pair Setup; not backed by a stored pairing.
    pub transient: bool,
    /// Slot of the pairing that verified this session.
    pub pairing_slot: Option<u8>,
    /// Accessory → controller channel.
    read_channel: Option<ControlChannel>,
    /// Controller → accessory channel.
    write_channel: Option<ControlChannel>,
    /// Pair Verify shared secret, kept for BLE broadcast key derivation.
    pub shared_secret: [u8; 32],
    /// Subscribed characteristic ordinals.
    pub subscriptions: BitSet<SUBSCRIPTION_SET_BYTES>,
    pub pair_setup: pair_setup::SessionState,
    pub pair_verify: pair_verify::SessionState,
}

impl Session {
    pub fn new(transport: Transport) -> Self {
        Session {
            transport,
            active: false,
            transient: false,
            pairing_slot: None,
            read_channel: None,
            write_channel: None,
            shared_secret: [0; 32],
            subscriptions: BitSet::new(),
            pair_setup: pair_setup::SessionState::default(),
            pair_verify: pair_verify::SessionState::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Opens the HAP session from a Pair Verify (or Pair Resume) shared secret.
    ///
    /// Derives the directional control-channel keys and resets both nonce counters.
    pub fn open(&mut self, shared_secret: &[u8; 32], pairing_slot: u8) {
        let mut read_key = [0; CHACHA20_POLY1305_KEY_BYTES];
        crypto::hkdf_sha512(
            &mut read_key,
            shared_secret,
            b"Control-Salt",
            b"Control-Read-Encryption-Key",
        );
        let mut write_key = [0; CHACHA20_POLY1305_KEY_BYTES];
        crypto::hkdf_sha512(
            &mut write_key,
            shared_secret,
            b"Control-Salt",
            b"Control-Write-Encryption-Key",
        );

        self.shared_secret = *shared_secret;
        self.read_channel = Some(ControlChannel::new(read_key));
        self.write_channel = Some(ControlChannel::new(write_key));
        self.pairing_slot = Some(pairing_slot);
        self.transient = false;
        self.active = true;
        debug!("session opened for pairing slot {}", pairing_slot);
    }

    /// Opens a transient HAP session directly from the Pair Setup SRP session key.
    ///
    /// No pairing backs the session; it ends with the connection.
    pub fn open_transient(&mut self, srp_session_key: &[u8; 64]) {
        let mut read_key = [0; CHACHA20_POLY1305_KEY_BYTES];
        crypto::hkdf_sha512(
            &mut read_key,
            srp_session_key,
            b"SplitSetupSalt",
            b"AccessoryEncrypt-Control",
        );
        let mut write_key = [0; CHACHA20_POLY1305_KEY_BYTES];
        crypto::hkdf_sha512(
            &mut write_key,
            srp_session_key,
            b"SplitSetupSalt",
            b"ControllerEncrypt-Control",
        );

        self.shared_secret = [0; 32];
        self.read_channel = Some(ControlChannel::new(read_key));
        self.write_channel = Some(ControlChannel::new(write_key));
        self.pairing_slot = None;
        self.transient = true;
        self.active = true;
        debug!("transient session opened");
    }

    /// Encrypts an outbound (accessory → controller) frame in place, returning the tag.
    pub fn encrypt_outbound(&mut self, aad: &[u8], buf: &mut [u8]) -> Result<[u8; 16], HapError> {
        match self.read_channel.as_mut() {
            Some(channel) if self.active => channel.encrypt(aad, buf),
            _ => Err(HapError::InvalidState),
        }
    }

    /// Decrypts an inbound (controller → accessory) frame in place.
    ///
    /// A tag failure invalidates the session before returning `Authentication`; the caller must
    /// drop the transport.
    pub fn decrypt_inbound(
        &mut self,
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; CHACHA20_POLY1305_TAG_BYTES],
    ) -> Result<(), HapError> {
        let result = match self.write_channel.as_mut() {
            Some(channel) if self.active => channel.decrypt(aad, buf, tag),
            _ => return Err(HapError::InvalidState),
        };
        if result.is_err() {
            warn!("inbound AEAD failure, invalidating session");
            self.invalidate();
        }
        result
    }

    /// Exposes the outbound nonce counter (for ordering assertions in tests).
    pub fn outbound_nonce(&self) -> Option<u64> {
        self.read_channel.as_ref().map(|c| c.nonce())
    }

    /// Tears the session down: keys and procedure state are dropped, pending responses are the
    /// caller's to discard.
    pub fn invalidate(&mut self) {
        self.active = false;
        self.transient = false;
        self.pairing_slot = None;
        self.read_channel = None;
        self.write_channel = None;
        self.shared_secret = [0; 32];
        self.subscriptions.clear();
        self.pair_setup = pair_setup::SessionState::default();
        self.pair_verify = pair_verify::SessionState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_pair() -> (Session, Session) {
        let secret = [0x5A; 32];
        let mut accessory = Session::new(Transport::Ip);
        accessory.open(&secret, 0);
        // The controller side mirrors the accessory with the channels swapped; reuse Session
        // by treating its "read" channel as the accessory's write key.
        let mut controller = Session::new(Transport::Ip);
        controller.open(&secret, 0);
        (accessory, controller)
    }

    #[test]
    fn nonces_strictly_increase() {
        let (mut session, _) = open_pair();
        assert_eq!(session.outbound_nonce(), Some(0));
        let mut buf = [0; 8];
        for i in 0..5 {
            session.encrypt_outbound(&[], &mut buf).unwrap();
            assert_eq!(session.outbound_nonce(), Some(i + 1));
        }
    }

    #[test]
    fn first_frame_uses_all_zero_nonce() {
        // S2: the first encrypted frame after Pair Verify decrypts under nonce counter 0.
        let secret = [0x11; 32];
        let mut session = Session::new(Transport::Ip);
        session.open(&secret, 0);

        let mut read_key = [0; 32];
        crypto::hkdf_sha512(
            &mut read_key,
            &secret,
            b"Control-Salt",
            b"Control-Read-Encryption-Key",
        );

        let mut frame = *b"GET /accessories";
        let tag = session.encrypt_outbound(&[], &mut frame).unwrap();
        crypto::chacha20_poly1305_decrypt(
            &read_key,
            &[0; 12],
            &[],
            &mut frame,
            &tag,
        )
        .unwrap();
        assert_eq!(&frame, b"GET /accessories");
    }

    #[test]
    fn directional_keys_differ() {
        let (mut accessory, mut controller) = open_pair();
        let mut buf = *b"ping";
        let tag = accessory.encrypt_outbound(&[], &mut buf).unwrap();
        // The controller's outbound channel uses the write key; the accessory's outbound frame
        // must not decrypt under it.
        assert!(controller.decrypt_inbound(&[], &mut buf, &tag).is_err());
    }

    #[test]
    fn aead_failure_invalidates() {
        let (mut accessory, _) = open_pair();
        let mut buf = [0; 4];
        let bad_tag = [0; 16];
        assert_eq!(
            accessory.decrypt_inbound(&[], &mut buf, &bad_tag),
            Err(HapError::Authentication)
        );
        assert!(!accessory.is_active());
        assert_eq!(
            accessory.encrypt_outbound(&[], &mut buf),
            Err(HapError::InvalidState)
        );
    }

    #[test]
    fn reopen_resets_nonces() {
        let (mut session, _) = open_pair();
        let mut buf = [0; 4];
        session.encrypt_outbound(&[], &mut buf).unwrap();
        assert_eq!(session.outbound_nonce(), Some(1));
        session.open(&[0x5A; 32], 0);
        assert_eq!(session.outbound_nonce(), Some(0));
    }

    #[test]
    fn transient_session_has_no_pairing() {
        let mut session = Session::new(Transport::Ble);
        session.open_transient(&[7; 64]);
        assert!(session.is_active());
        assert!(session.transient);
        assert_eq!(session.pairing_slot, None);
    }
}
