//! The Pair Setup engine: six half-duplex SRP messages M1..M6.
//!
//! Pair Setup is the only procedure with server-wide state: at most one session may be pairing
//! at any time, guarded by a claim on the engine that expires after
//! [`Duration::PAIR_SETUP_TIMEOUT`]. The SRP working set (ephemeral keys, proofs, session key)
//! lives in the engine rather than the session for the same reason.
//!
//! Messages with odd numbers arrive via [`handle_write`], the accessory's answers are produced
//! by [`handle_read`]. Protocol errors travel as a `kTLVType_Error` record in the next read and
//! terminate the attempt; the controller restarts from M1.
//!
//! [`Duration::PAIR_SETUP_TIMEOUT`]: ../../time/struct.Duration.html
//! [`handle_write`]: struct.PairSetup.html#method.handle_write
//! [`handle_read`]: struct.PairSetup.html#method.handle_read

use subtle::ConstantTimeEq;

use crate::crypto::{self, srp};
use crate::platform::{config_key, AuthCoprocessor, Domain, KeyValueStore, PlatformConfig};
use crate::session::Session;
use crate::time::{Duration, Instant};
use crate::tlv::{TlvReader, TlvWriter};
use crate::HapError;

use super::{tlv_type, Method, Pairing, PairingError, PairingResources, PairingStore, Permissions};

/// Pairing flag: establish a transient session without persisting a pairing.
pub const FLAG_TRANSIENT: u32 = 0x10;
/// Pairing flag: split Pair Setup; the verifier from a preceding transient attempt is reused.
pub const FLAG_SPLIT: u32 = 0x0100_0000;

/// Failed-authentication ceiling; reaching it locks Pair Setup until factory reset.
pub const MAX_AUTH_ATTEMPTS: u8 = 100;

/// Largest `kTLVType_EncryptedData` accepted in M5.
const MAX_M5_DATA: usize = 512;

/// Per-session Pair Setup cursor.
#[derive(Debug)]
pub struct SessionState {
    /// Last processed message number; 0 when idle.
    m: u8,
    method: Method,
    error: Option<PairingError>,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            m: 0,
            method: Method::PairSetup,
            error: None,
        }
    }
}

impl SessionState {
    /// Whether a Pair Setup attempt is in flight on this session.
    pub fn in_progress(&self) -> bool {
        self.m != 0
    }
}

/// The server-wide Pair Setup engine.
pub struct PairSetup {
    /// Registry index of the session holding the pairing claim.
    owner: Option<usize>,
    claimed_at: Instant,
    flags_present: bool,
    flags: u32,
    b: [u8; srp::SECRET_KEY_BYTES],
    big_b: [u8; srp::PRIME_BYTES],
    big_a: [u8; srp::PRIME_BYTES],
    controller_proof: [u8; srp::PROOF_BYTES],
    k: [u8; srp::SESSION_KEY_BYTES],
    session_key: [u8; crypto::CHACHA20_POLY1305_KEY_BYTES],
}

impl PairSetup {
    pub const fn new() -> Self {
        PairSetup {
            owner: None,
            claimed_at: Instant::from_raw_millis(0),
            flags_present: false,
            flags: 0,
            b: [0; srp::SECRET_KEY_BYTES],
            big_b: [0; srp::PRIME_BYTES],
            big_a: [0; srp::PRIME_BYTES],
            controller_proof: [0; srp::PROOF_BYTES],
            k: [0; srp::SESSION_KEY_BYTES],
            session_key: [0; crypto::CHACHA20_POLY1305_KEY_BYTES],
        }
    }

    /// The session currently holding the pairing claim, if any.
    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    fn zeroize(&mut self) {
        self.flags_present = false;
        self.flags = 0;
        self.b = [0; srp::SECRET_KEY_BYTES];
        self.big_b = [0; srp::PRIME_BYTES];
        self.big_a = [0; srp::PRIME_BYTES];
        self.controller_proof = [0; srp::PROOF_BYTES];
        self.k = [0; srp::SESSION_KEY_BYTES];
        self.session_key = [0; crypto::CHACHA20_POLY1305_KEY_BYTES];
    }

    /// Ends the attempt on `session`. The claim and working set are only released when the
    /// session owns them; an interloper that was answered with `Busy` does not disturb the
    /// owner's attempt.
    pub fn reset_for_session<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
        session: &mut Session,
        keep_setup_info: bool,
    ) {
        session.pair_setup = SessionState::default();
        if self.owner == Some(session_index) {
            self.owner = None;
            self.zeroize();
            resources.setup_info.reset(keep_setup_info);
        }
    }

    /// Releases the claim when its holder disconnected.
    pub fn handle_session_invalidated<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
    ) {
        if self.owner == Some(session_index) {
            self.owner = None;
            self.zeroize();
            resources.setup_info.reset(false);
        }
    }

    fn is_transient(&self, state: &SessionState) -> bool {
        self.flags_present && self.flags & FLAG_TRANSIENT != 0 && state.method == Method::PairSetup
    }

    fn is_split(&self, state: &SessionState) -> bool {
        self.flags_present && self.flags & FLAG_SPLIT != 0 && state.method == Method::PairSetup
    }

    /// Handles one controller → accessory Pair Setup message (M1, M3, M5).
    pub fn handle_write<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
        session: &mut Session,
        body: &[u8],
    ) -> Result<(), HapError> {
        let reader = TlvReader::new(body);
        reader.validate().map_err(|_| HapError::InvalidData)?;

        if session.pair_setup.error.is_some() {
            // The pending error has to be read out first.
            return Err(HapError::InvalidState);
        }

        let m = reader
            .expect(tlv_type::STATE)
            .and_then(|v| v.parse_u8())
            .map_err(|_| HapError::InvalidData)?;
        match m {
            1 => self.process_m1(resources, session_index, session, &reader),
            3 => self.process_m3(session_index, session, &reader),
            5 => self.process_m5(resources, session_index, session, &reader),
            _ => {
                warn!("Pair Setup: unexpected state {} in write", m);
                Err(HapError::InvalidData)
            }
        }
    }

    /// Produces the next accessory → controller Pair Setup message (M2, M4, M6).
    ///
    /// A pending procedure error is emitted here (state + error record) and ends the attempt.
    pub fn handle_read<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
        session: &mut Session,
        writer: &mut TlvWriter<'_>,
    ) -> Result<(), HapError> {
        if session.pair_setup.m == 0 || session.pair_setup.m % 2 == 0 {
            return Err(HapError::InvalidState);
        }
        let response_m = session.pair_setup.m + 1;

        let mut completed = false;
        if session.pair_setup.error.is_none() {
            completed = match response_m {
                2 => self.get_m2(resources, session_index, session, writer)?,
                4 => self.get_m4(resources, session_index, session, writer)?,
                6 => self.get_m6(resources, session_index, session, writer)?,
                _ => return Err(HapError::InvalidState),
            };
        }

        if let Some(error) = session.pair_setup.error {
            info!("Pair Setup M{}: error {:?}", response_m, error);
            writer
                .append_u8(tlv_type::STATE, response_m)
                .and_then(|_| writer.append_u8(tlv_type::ERROR, error.into()))
                .map_err(|_| HapError::OutOfResources)?;
            self.reset_for_session(resources, session_index, session, false);
            return Ok(());
        }

        if !completed {
            session.pair_setup.m = response_m;
        }
        Ok(())
    }

    fn process_m1<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
        session: &mut Session,
        reader: &TlvReader<'_>,
    ) -> Result<(), HapError> {
        debug!("Pair Setup M1: SRP Start Request");

        if session.pair_setup.m != 0 {
            // Restarting mid-procedure aborts the previous attempt but keeps the verifier.
            info!("Pair Setup M1: restarting procedure");
            self.reset_for_session(resources, session_index, session, true);
        }

        let method = reader
            .expect(tlv_type::METHOD)
            .and_then(|v| v.parse_u8())
            .map(Method::from)
            .map_err(|_| HapError::InvalidData)?;
        if method != Method::PairSetup && method != Method::PairSetupWithAuth {
            warn!("Pair Setup M1: invalid method {:?}", method);
            return Err(HapError::InvalidData);
        }

        let flags = match reader.find(tlv_type::FLAGS) {
            None => None,
            Some(value) if value.len() <= 4 => {
                Some(value.parse_uint_le().map_err(|_| HapError::InvalidData)? as u32)
            }
            Some(_) => return Err(HapError::InvalidData),
        };

        // Claim the server-wide pairing slot, preempting an expired claim.
        match self.owner {
            None => {
                self.owner = Some(session_index);
                self.claimed_at = resources.now;
            }
            Some(index) if index == session_index => {
                self.claimed_at = resources.now;
            }
            Some(_) => {
                if resources.now.duration_since(self.claimed_at) > Duration::PAIR_SETUP_TIMEOUT {
                    info!("Pair Setup M1: preempting expired claim");
                    self.zeroize();
                    resources.setup_info.reset(true);
                    self.owner = Some(session_index);
                    self.claimed_at = resources.now;
                }
                // Otherwise leave the claim alone; M2 answers with Busy.
            }
        }

        if self.owner == Some(session_index) {
            match flags {
                Some(flags) => {
                    self.flags_present = true;
                    self.flags = flags;
                }
                None => {
                    self.flags_present = false;
                    self.flags = 0;
                }
            }
        }

        session.pair_setup.method = method;
        session.pair_setup.m = 1;
        Ok(())
    }

    fn get_m2<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
        session: &mut Session,
        writer: &mut TlvWriter<'_>,
    ) -> Result<bool, HapError> {
        debug!("Pair Setup M2: SRP Start Response");
        let state = &mut session.pair_setup;

        if self.owner.is_none() || PairingStore::any(resources.store)? {
            info!("Pair Setup M2: accessory is already paired");
            state.error = Some(PairingError::Unavailable);
            return Ok(false);
        }
        if auth_attempts(resources.store)? >= MAX_AUTH_ATTEMPTS {
            info!("Pair Setup M2: too many unsuccessful authentication attempts");
            state.error = Some(PairingError::MaxTries);
            return Ok(false);
        }
        if self.owner != Some(session_index) {
            info!("Pair Setup M2: busy with another controller");
            state.error = Some(PairingError::Busy);
            return Ok(false);
        }

        let mut unknown = self.flags;
        let is_transient = self.is_transient(state);
        let is_split = self.is_split(state);
        unknown &= !(FLAG_TRANSIENT | FLAG_SPLIT);
        if unknown != 0 {
            info!("Pair Setup M2: ignoring unrecognized pairing flags {:#x}", unknown);
        }

        let restore_previous = !is_transient && is_split;
        let info = match resources
            .setup_info
            .get(resources.setup_code, resources.rng, restore_previous)
        {
            Some(info) => info,
            None => {
                info!("Pair Setup M2: split requested but no previous setup info");
                state.error = Some(PairingError::Authentication);
                return Ok(false);
            }
        };
        let salt = info.salt;
        let verifier = info.verifier;

        use rand_core::RngCore;
        resources.rng.fill_bytes(&mut self.b);
        self.big_b = srp::public_key(&self.b, &verifier);

        writer.append_u8(tlv_type::STATE, 2)?;
        writer.append(tlv_type::PUBLIC_KEY, srp::strip_leading_zeros(&self.big_b))?;
        writer.append(tlv_type::SALT, &salt)?;

        let mut echo = 0;
        if is_transient && is_split {
            echo = FLAG_TRANSIENT | FLAG_SPLIT;
        } else if is_split {
            echo = FLAG_SPLIT;
        }
        if echo != 0 {
            writer.append_uint_le(tlv_type::FLAGS, u64::from(echo))?;
        }
        Ok(false)
    }

    fn process_m3(
        &mut self,
        session_index: usize,
        session: &mut Session,
        reader: &TlvReader<'_>,
    ) -> Result<(), HapError> {
        debug!("Pair Setup M3: SRP Verify Request");
        if self.owner != Some(session_index) || session.pair_setup.m != 2 {
            return Err(HapError::InvalidState);
        }

        let public_key = reader
            .expect(tlv_type::PUBLIC_KEY)
            .map_err(|_| HapError::InvalidData)?;
        if public_key.is_empty() || public_key.len() > srp::PRIME_BYTES {
            return Err(HapError::InvalidData);
        }
        // Zero-extend the big-endian value to the group size.
        let mut scratch = [0; srp::PRIME_BYTES];
        let bytes = public_key
            .copy_into(&mut scratch)
            .map_err(|_| HapError::InvalidData)?;
        self.big_a = [0; srp::PRIME_BYTES];
        self.big_a[srp::PRIME_BYTES - bytes.len()..].copy_from_slice(bytes);

        let proof = reader
            .expect(tlv_type::PROOF)
            .map_err(|_| HapError::InvalidData)?;
        if proof.len() != srp::PROOF_BYTES {
            return Err(HapError::InvalidData);
        }
        proof
            .copy_into(&mut self.controller_proof)
            .map_err(|_| HapError::InvalidData)?;

        session.pair_setup.m = 3;
        Ok(())
    }

    fn get_m4<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
        session: &mut Session,
        writer: &mut TlvWriter<'_>,
    ) -> Result<bool, HapError> {
        debug!("Pair Setup M4: SRP Verify Response");
        if self.owner != Some(session_index) {
            return Err(HapError::InvalidState);
        }
        let state = &mut session.pair_setup;

        let u = srp::scrambling_parameter(&self.big_a, &self.big_b);
        let restore_previous = !self.is_transient(state) && self.is_split(state);
        let verifier = resources
            .setup_info
            .get(resources.setup_code, resources.rng, restore_previous)
            .ok_or(HapError::Unknown)?
            .verifier;
        let salt = resources
            .setup_info
            .get(resources.setup_code, resources.rng, restore_previous)
            .ok_or(HapError::Unknown)?
            .salt;

        let premaster = match srp::premaster_secret(&self.big_a, &self.b, &u, &verifier) {
            Ok(premaster) => premaster,
            Err(srp::IllegalPublicKey) => {
                info!("Pair Setup M4: illegal controller public key");
                state.error = Some(PairingError::Authentication);
                return Ok(false);
            }
        };
        self.k = srp::session_key(&premaster);

        let expected = srp::proof_m1(srp::USERNAME, &salt, &self.big_a, &self.big_b, &self.k);
        if !bool::from(expected.ct_eq(&self.controller_proof)) {
            let attempts = auth_attempts(resources.store)?.saturating_add(1);
            resources.store.set(
                Domain::Configuration,
                config_key::UNSUCCESSFUL_AUTH_ATTEMPTS,
                &[attempts],
            )?;
            info!(
                "Pair Setup M4: incorrect setup code, attempt {} of {}",
                attempts, MAX_AUTH_ATTEMPTS
            );
            state.error = Some(PairingError::Authentication);
            return Ok(false);
        }

        resources
            .store
            .remove(Domain::Configuration, config_key::UNSUCCESSFUL_AUTH_ATTEMPTS)?;

        let m2 = srp::proof_m2(&self.big_a, &self.controller_proof, &self.k);
        crypto::hkdf_sha512(
            &mut self.session_key,
            &self.k,
            b"Pair-Setup-Encrypt-Salt",
            b"Pair-Setup-Encrypt-Info",
        );

        writer.append_u8(tlv_type::STATE, 4)?;
        writer.append(tlv_type::PROOF, &m2)?;

        if state.method == Method::PairSetupWithAuth {
            self.append_mfi_proof(resources, writer)?;
        }

        if self.is_transient(state) {
            info!("Pair Setup M4: starting transient session");
            session.open_transient(&self.k);
            self.reset_for_session(resources, session_index, session, true);
            return Ok(true);
        }
        Ok(false)
    }

    /// Appends the Apple Authentication Coprocessor certificate and challenge signature,
    /// encrypted under the M4 nonce.
    fn append_mfi_proof<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        writer: &mut TlvWriter<'_>,
    ) -> Result<(), HapError> {
        let auth = resources.auth.ok_or_else(|| {
            warn!("Pair Setup M4: Apple Authentication Coprocessor is not available");
            HapError::InvalidState
        })?;

        let mut challenge = [0; 32];
        crypto::hkdf_sha512(
            &mut challenge,
            &self.k,
            b"MFi-Pair-Setup-Salt",
            b"MFi-Pair-Setup-Info",
        );

        let session_key = self.session_key;
        writer.with_scratch(1024, |writer, scratch| {
            let (sub_buf, work) = scratch.split_at_mut(768);

            let mut sub = TlvWriter::new(sub_buf);
            let sig_len = auth
                .create_signature(&challenge, work)
                .map_err(|_| crate::Error::InvalidValue)?;
            sub.append(tlv_type::SIGNATURE, &work[..sig_len])?;
            let cert_len = auth
                .copy_certificate(work)
                .map_err(|_| crate::Error::InvalidValue)?;
            sub.append(tlv_type::CERTIFICATE, &work[..cert_len])?;

            let len = sub.finish();
            let nonce = crypto::nonce_from_label(b"PS-Msg04");
            let tag =
                crypto::chacha20_poly1305_encrypt(&session_key, &nonce, &[], &mut sub_buf[..len]);
            sub_buf[len..len + tag.len()].copy_from_slice(&tag);
            writer.append(tlv_type::ENCRYPTED_DATA, &sub_buf[..len + tag.len()])
        })?;
        Ok(())
    }

    fn process_m5<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
        session: &mut Session,
        reader: &TlvReader<'_>,
    ) -> Result<(), HapError> {
        debug!("Pair Setup M5: Exchange Request");
        if self.owner != Some(session_index) || session.pair_setup.m != 4 {
            return Err(HapError::InvalidState);
        }
        session.pair_setup.m = 5;

        let encrypted = reader
            .expect(tlv_type::ENCRYPTED_DATA)
            .map_err(|_| HapError::InvalidData)?;
        if encrypted.len() < crypto::CHACHA20_POLY1305_TAG_BYTES || encrypted.len() > MAX_M5_DATA {
            return Err(HapError::InvalidData);
        }
        let mut buf = [0; MAX_M5_DATA];
        let data = encrypted
            .copy_into(&mut buf)
            .map_err(|_| HapError::InvalidData)?;
        let len = data.len() - crypto::CHACHA20_POLY1305_TAG_BYTES;
        let mut tag = [0; crypto::CHACHA20_POLY1305_TAG_BYTES];
        let tag_len = tag.len();
        tag.copy_from_slice(&buf[len..len + tag_len]);

        let nonce = crypto::nonce_from_label(b"PS-Msg05");
        if crypto::chacha20_poly1305_decrypt(
            &self.session_key,
            &nonce,
            &[],
            &mut buf[..len],
            &tag,
        )
        .is_err()
        {
            info!("Pair Setup M5: encrypted data failed to authenticate");
            session.pair_setup.error = Some(PairingError::Authentication);
            return Ok(());
        }

        let sub = TlvReader::new(&buf[..len]);
        let identifier_tlv = sub
            .expect(tlv_type::IDENTIFIER)
            .map_err(|_| HapError::InvalidData)?;
        let mut identifier = [0; super::MAX_IDENTIFIER_BYTES];
        if identifier_tlv.is_empty() || identifier_tlv.len() > identifier.len() {
            return Err(HapError::InvalidData);
        }
        let identifier = identifier_tlv
            .copy_into(&mut identifier)
            .map_err(|_| HapError::InvalidData)?;

        let ltpk_tlv = sub
            .expect(tlv_type::PUBLIC_KEY)
            .map_err(|_| HapError::InvalidData)?;
        let mut ltpk = [0; crypto::ED25519_PUBLIC_KEY_BYTES];
        if ltpk_tlv.len() != ltpk.len() {
            return Err(HapError::InvalidData);
        }
        ltpk_tlv.copy_into(&mut ltpk).map_err(|_| HapError::InvalidData)?;

        let signature_tlv = sub
            .expect(tlv_type::SIGNATURE)
            .map_err(|_| HapError::InvalidData)?;
        let mut signature = [0; crypto::ED25519_BYTES];
        if signature_tlv.len() != signature.len() {
            return Err(HapError::InvalidData);
        }
        signature_tlv
            .copy_into(&mut signature)
            .map_err(|_| HapError::InvalidData)?;

        // iOSDeviceInfo = iOSDeviceX | iOSDevicePairingID | iOSDeviceLTPK.
        let mut info = [0; 32 + super::MAX_IDENTIFIER_BYTES + crypto::ED25519_PUBLIC_KEY_BYTES];
        crypto::hkdf_sha512(
            &mut info[..32],
            &self.k,
            b"Pair-Setup-Controller-Sign-Salt",
            b"Pair-Setup-Controller-Sign-Info",
        );
        info[32..32 + identifier.len()].copy_from_slice(identifier);
        info[32 + identifier.len()..32 + identifier.len() + ltpk.len()].copy_from_slice(&ltpk);
        let info_len = 32 + identifier.len() + ltpk.len();

        if crypto::ed25519_verify(&ltpk, &info[..info_len], &signature).is_err() {
            info!("Pair Setup M5: controller signature is invalid");
            session.pair_setup.error = Some(PairingError::Authentication);
            return Ok(());
        }

        let slot = match PairingStore::free_slot(resources.store)? {
            Some(slot) => slot,
            None => {
                info!("Pair Setup M5: no free pairing slots");
                session.pair_setup.error = Some(PairingError::MaxPeers);
                return Ok(());
            }
        };
        let pairing = Pairing::new(identifier, ltpk, Permissions::ADMIN)?;
        PairingStore::set(resources.store, slot, &pairing)?;
        info!("Pair Setup M5: stored admin pairing in slot {}", slot);
        Ok(())
    }

    fn get_m6<C: PlatformConfig>(
        &mut self,
        resources: &mut PairingResources<'_, C>,
        session_index: usize,
        session: &mut Session,
        writer: &mut TlvWriter<'_>,
    ) -> Result<bool, HapError> {
        debug!("Pair Setup M6: Exchange Response");
        if self.owner != Some(session_index) {
            return Err(HapError::InvalidState);
        }

        writer.append_u8(tlv_type::STATE, 6)?;

        let identity = resources.identity;
        let device_id = identity.device_id.to_string_bytes();

        // AccessoryInfo = AccessoryX | AccessoryPairingID | AccessoryLTPK.
        let mut info = [0; 32 + crate::accessory::DEVICE_ID_STRING_BYTES + crypto::ED25519_PUBLIC_KEY_BYTES];
        crypto::hkdf_sha512(
            &mut info[..32],
            &self.k,
            b"Pair-Setup-Accessory-Sign-Salt",
            b"Pair-Setup-Accessory-Sign-Info",
        );
        info[32..32 + device_id.len()].copy_from_slice(&device_id);
        info[32 + device_id.len()..].copy_from_slice(&identity.ed_ltpk);
        let signature = crypto::ed25519_sign(&identity.ed_ltsk, &identity.ed_ltpk, &info);

        let session_key = self.session_key;
        writer.with_scratch(256, |writer, scratch| {
            let mut sub = TlvWriter::new(scratch);
            sub.append(tlv_type::IDENTIFIER, &device_id)?;
            sub.append(tlv_type::PUBLIC_KEY, &identity.ed_ltpk)?;
            sub.append(tlv_type::SIGNATURE, &signature)?;
            let len = sub.finish();

            let nonce = crypto::nonce_from_label(b"PS-Msg06");
            let tag =
                crypto::chacha20_poly1305_encrypt(&session_key, &nonce, &[], &mut scratch[..len]);
            scratch[len..len + tag.len()].copy_from_slice(&tag);
            writer.append(tlv_type::ENCRYPTED_DATA, &scratch[..len + tag.len()])
        })?;

        self.reset_for_session(resources, session_index, session, false);
        Ok(true)
    }
}

/// Reads the persistent failed-attempt counter.
pub fn auth_attempts<S: KeyValueStore>(store: &S) -> Result<u8, HapError> {
    let mut buf = [0; 1];
    match store.get(Domain::Configuration, config_key::UNSUCCESSFUL_AUTH_ATTEMPTS, &mut buf)? {
        Some([count]) => Ok(*count),
        Some(_) => Err(HapError::Unknown),
        None => Ok(0),
    }
}
