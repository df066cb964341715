//! The Pair Verify engine: four X25519 key-agreement messages, plus Pair Resume on BLE.
//!
//! Unlike Pair Setup there is no server-wide lock; every session verifies independently and all
//! state fits in the session. A successful M4 (or a successful resume M2) opens the HAP session
//! by deriving the directional control-channel keys from the agreed shared secret.

use rand_core::RngCore;

use crate::crypto;
use crate::platform::PlatformConfig;
use crate::session::{Session, Transport};
use crate::tlv::{TlvReader, TlvWriter};
use crate::HapError;

use super::cache::SESSION_ID_BYTES;
use super::{tlv_type, Method, PairingError, PairingResources, PairingStore};

/// Per-session Pair Verify state.
pub struct SessionState {
    /// Last processed message number; 0 when idle.
    m: u8,
    error: Option<PairingError>,
    cv_sk: [u8; crypto::X25519_SCALAR_BYTES],
    cv_pk: [u8; crypto::X25519_BYTES],
    controller_cv_pk: [u8; crypto::X25519_BYTES],
    shared_secret: [u8; 32],
    session_key: [u8; crypto::CHACHA20_POLY1305_KEY_BYTES],
    /// Pairing that signed M3; filled in during M3 processing.
    pairing_slot: Option<u8>,
    /// Resume state: the cached secret consumed in M1 and the controller's request tag.
    resume: Option<Resume>,
}

struct Resume {
    session_id: [u8; SESSION_ID_BYTES],
    request_tag: [u8; crypto::CHACHA20_POLY1305_TAG_BYTES],
    shared_secret: [u8; 32],
    pairing_slot: u8,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            m: 0,
            error: None,
            cv_sk: [0; crypto::X25519_SCALAR_BYTES],
            cv_pk: [0; crypto::X25519_BYTES],
            controller_cv_pk: [0; crypto::X25519_BYTES],
            shared_secret: [0; 32],
            session_key: [0; crypto::CHACHA20_POLY1305_KEY_BYTES],
            pairing_slot: None,
            resume: None,
        }
    }
}

impl SessionState {
    pub fn in_progress(&self) -> bool {
        self.m != 0
    }
}

/// Handles one controller → accessory Pair Verify message (M1 or M3).
pub fn handle_write<C: PlatformConfig>(
    resources: &mut PairingResources<'_, C>,
    session: &mut Session,
    body: &[u8],
) -> Result<(), HapError> {
    let reader = TlvReader::new(body);
    reader.validate().map_err(|_| HapError::InvalidData)?;

    if session.pair_verify.error.is_some() {
        return Err(HapError::InvalidState);
    }

    let m = reader
        .expect(tlv_type::STATE)
        .and_then(|v| v.parse_u8())
        .map_err(|_| HapError::InvalidData)?;
    match m {
        1 => process_m1(resources, session, &reader),
        3 => process_m3(resources, session, &reader),
        _ => {
            warn!("Pair Verify: unexpected state {} in write", m);
            Err(HapError::InvalidData)
        }
    }
}

/// Produces the next accessory → controller Pair Verify message (M2 or M4).
pub fn handle_read<C: PlatformConfig>(
    resources: &mut PairingResources<'_, C>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<(), HapError> {
    if session.pair_verify.m == 0 || session.pair_verify.m % 2 == 0 {
        return Err(HapError::InvalidState);
    }
    let response_m = session.pair_verify.m + 1;

    let mut completed = false;
    if session.pair_verify.error.is_none() {
        completed = match response_m {
            2 => get_m2(resources, session, writer)?,
            4 => get_m4(resources, session, writer)?,
            _ => return Err(HapError::InvalidState),
        };
    }

    if let Some(error) = session.pair_verify.error {
        info!("Pair Verify M{}: error {:?}", response_m, error);
        writer
            .append_u8(tlv_type::STATE, response_m)
            .and_then(|_| writer.append_u8(tlv_type::ERROR, error.into()))
            .map_err(|_| HapError::OutOfResources)?;
        session.pair_verify = SessionState::default();
        return Ok(());
    }

    if completed {
        session.pair_verify = SessionState::default();
    } else {
        session.pair_verify.m = response_m;
    }
    Ok(())
}

fn process_m1<C: PlatformConfig>(
    resources: &mut PairingResources<'_, C>,
    session: &mut Session,
    reader: &TlvReader<'_>,
) -> Result<(), HapError> {
    debug!("Pair Verify M1: Verify Start Request");

    // A fresh M1 discards any verified session and any half-finished verify attempt.
    if session.is_active() || session.pair_verify.in_progress() {
        info!("Pair Verify M1: discarding previous session state");
        session.invalidate();
    }

    let public_key = reader
        .expect(tlv_type::PUBLIC_KEY)
        .map_err(|_| HapError::InvalidData)?;
    if public_key.len() != crypto::X25519_BYTES {
        return Err(HapError::InvalidData);
    }
    public_key
        .copy_into(&mut session.pair_verify.controller_cv_pk)
        .map_err(|_| HapError::InvalidData)?;

    let method = match reader.find(tlv_type::METHOD) {
        None => None,
        Some(v) => Some(Method::from(v.parse_u8().map_err(|_| HapError::InvalidData)?)),
    };

    if method == Some(Method::PairResume) {
        if session.transport != Transport::Ble {
            return Err(HapError::InvalidData);
        }
        let session_id = reader
            .expect(tlv_type::SESSION_ID)
            .map_err(|_| HapError::InvalidData)?;
        if session_id.len() != SESSION_ID_BYTES {
            return Err(HapError::InvalidData);
        }
        let mut id = [0; SESSION_ID_BYTES];
        session_id.copy_into(&mut id).map_err(|_| HapError::InvalidData)?;

        let encrypted = reader
            .expect(tlv_type::ENCRYPTED_DATA)
            .map_err(|_| HapError::InvalidData)?;
        if encrypted.len() != crypto::CHACHA20_POLY1305_TAG_BYTES {
            return Err(HapError::InvalidData);
        }
        let mut tag = [0; crypto::CHACHA20_POLY1305_TAG_BYTES];
        encrypted.copy_into(&mut tag).map_err(|_| HapError::InvalidData)?;

        // On a cache miss the attempt silently downgrades to a full Pair Verify.
        if let Some((shared_secret, pairing_slot)) = resources.session_cache.take(&id) {
            session.pair_verify.resume = Some(Resume {
                session_id: id,
                request_tag: tag,
                shared_secret,
                pairing_slot,
            });
        } else {
            info!("Pair Resume M1: unknown session id, downgrading to Pair Verify");
        }
    }

    session.pair_verify.m = 1;
    Ok(())
}

fn get_m2<C: PlatformConfig>(
    resources: &mut PairingResources<'_, C>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<bool, HapError> {
    if let Some(resume) = session.pair_verify.resume.take() {
        match try_resume(resources, session, &resume, writer)? {
            true => return Ok(true),
            false => {
                info!("Pair Resume M2: request tag invalid, downgrading to Pair Verify");
            }
        }
    }

    debug!("Pair Verify M2: Verify Start Response");
    let state = &mut session.pair_verify;

    resources.rng.fill_bytes(&mut state.cv_sk);
    state.cv_pk = crypto::x25519_scalarmult_base(&state.cv_sk);
    state.shared_secret = crypto::x25519_scalarmult(&state.cv_sk, &state.controller_cv_pk);
    crypto::hkdf_sha512(
        &mut state.session_key,
        &state.shared_secret,
        b"Pair-Verify-Encrypt-Salt",
        b"Pair-Verify-Encrypt-Info",
    );

    let identity = resources.identity;
    let device_id = identity.device_id.to_string_bytes();

    // AccessoryInfo = cv_PK | AccessoryPairingID | iOSDeviceCv_PK.
    let mut info = [0; crypto::X25519_BYTES + 17 + crypto::X25519_BYTES];
    info[..32].copy_from_slice(&state.cv_pk);
    info[32..32 + device_id.len()].copy_from_slice(&device_id);
    info[32 + device_id.len()..].copy_from_slice(&state.controller_cv_pk);
    let signature = crypto::ed25519_sign(&identity.ed_ltsk, &identity.ed_ltpk, &info);

    writer.append_u8(tlv_type::STATE, 2)?;
    writer.append(tlv_type::PUBLIC_KEY, &state.cv_pk)?;

    let session_key = state.session_key;
    writer.with_scratch(256, |writer, scratch| {
        let mut sub = TlvWriter::new(scratch);
        sub.append(tlv_type::IDENTIFIER, &device_id)?;
        sub.append(tlv_type::SIGNATURE, &signature)?;
        let len = sub.finish();

        let nonce = crypto::nonce_from_label(b"PV-Msg02");
        let tag = crypto::chacha20_poly1305_encrypt(&session_key, &nonce, &[], &mut scratch[..len]);
        scratch[len..len + tag.len()].copy_from_slice(&tag);
        writer.append(tlv_type::ENCRYPTED_DATA, &scratch[..len + tag.len()])
    })?;
    Ok(false)
}

/// Attempts the resume handshake. Returns `Ok(true)` when the session was re-established,
/// `Ok(false)` to fall back to a full Pair Verify.
fn try_resume<C: PlatformConfig>(
    resources: &mut PairingResources<'_, C>,
    session: &mut Session,
    resume: &Resume,
    writer: &mut TlvWriter<'_>,
) -> Result<bool, HapError> {
    debug!("Pair Resume M2: Resume Response");
    let controller_cv_pk = session.pair_verify.controller_cv_pk;

    // RequestKey = HKDF(cached secret, Controller cv_PK | old SessionID, request info).
    let mut salt = [0; crypto::X25519_BYTES + SESSION_ID_BYTES];
    salt[..32].copy_from_slice(&controller_cv_pk);
    salt[32..].copy_from_slice(&resume.session_id);
    let mut request_key = [0; 32];
    crypto::hkdf_sha512(
        &mut request_key,
        &resume.shared_secret,
        &salt,
        b"Pair-Resume-Request-Info",
    );

    let nonce = crypto::nonce_from_label(b"PR-Msg01");
    let mut empty = [0; 0];
    if crypto::chacha20_poly1305_decrypt(&request_key, &nonce, &[], &mut empty, &resume.request_tag)
        .is_err()
    {
        return Ok(false);
    }

    // The controller proved possession; mint a new session id and re-key.
    let mut new_session_id = [0; SESSION_ID_BYTES];
    resources.rng.fill_bytes(&mut new_session_id);
    salt[32..].copy_from_slice(&new_session_id);

    let mut response_key = [0; 32];
    crypto::hkdf_sha512(
        &mut response_key,
        &resume.shared_secret,
        &salt,
        b"Pair-Resume-Response-Info",
    );
    let nonce = crypto::nonce_from_label(b"PR-Msg02");
    let mut empty = [0; 0];
    let response_tag = crypto::chacha20_poly1305_encrypt(&response_key, &nonce, &[], &mut empty);

    let mut new_shared_secret = [0; 32];
    crypto::hkdf_sha512(
        &mut new_shared_secret,
        &resume.shared_secret,
        &salt,
        b"Pair-Resume-Shared-Secret-Info",
    );

    resources
        .session_cache
        .save(&new_session_id, &new_shared_secret, resume.pairing_slot);

    writer.append_u8(tlv_type::STATE, 2)?;
    writer.append_u8(tlv_type::METHOD, Method::PairResume.into())?;
    writer.append(tlv_type::SESSION_ID, &new_session_id)?;
    writer.append(tlv_type::ENCRYPTED_DATA, &response_tag)?;

    session.open(&new_shared_secret, resume.pairing_slot);
    info!("Pair Resume M2: session re-established");
    Ok(true)
}

fn process_m3<C: PlatformConfig>(
    resources: &mut PairingResources<'_, C>,
    session: &mut Session,
    reader: &TlvReader<'_>,
) -> Result<(), HapError> {
    debug!("Pair Verify M3: Verify Finish Request");
    if session.pair_verify.m != 2 {
        return Err(HapError::InvalidState);
    }
    session.pair_verify.m = 3;

    let encrypted = reader
        .expect(tlv_type::ENCRYPTED_DATA)
        .map_err(|_| HapError::InvalidData)?;
    if encrypted.len() < crypto::CHACHA20_POLY1305_TAG_BYTES || encrypted.len() > 256 {
        return Err(HapError::InvalidData);
    }
    let mut buf = [0; 256];
    let data = encrypted
        .copy_into(&mut buf)
        .map_err(|_| HapError::InvalidData)?;
    let len = data.len() - crypto::CHACHA20_POLY1305_TAG_BYTES;
    let mut tag = [0; crypto::CHACHA20_POLY1305_TAG_BYTES];
    let tag_len = tag.len();
    tag.copy_from_slice(&buf[len..len + tag_len]);

    let nonce = crypto::nonce_from_label(b"PV-Msg03");
    if crypto::chacha20_poly1305_decrypt(
        &session.pair_verify.session_key,
        &nonce,
        &[],
        &mut buf[..len],
        &tag,
    )
    .is_err()
    {
        info!("Pair Verify M3: encrypted data failed to authenticate");
        session.pair_verify.error = Some(PairingError::Authentication);
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

    let (slot, pairing) = match PairingStore::find(resources.store, identifier)? {
        Some(found) => found,
        None => {
            info!("Pair Verify M3: unknown controller");
            session.pair_verify.error = Some(PairingError::Authentication);
            return Ok(());
        }
    };

    // iOSDeviceInfo = iOSDeviceCv_PK | iOSDevicePairingID | AccessoryCv_PK.
    let mut info = [0; crypto::X25519_BYTES + super::MAX_IDENTIFIER_BYTES + crypto::X25519_BYTES];
    info[..32].copy_from_slice(&session.pair_verify.controller_cv_pk);
    info[32..32 + identifier.len()].copy_from_slice(identifier);
    info[32 + identifier.len()..32 + identifier.len() + 32]
        .copy_from_slice(&session.pair_verify.cv_pk);
    let info_len = 64 + identifier.len();

    if crypto::ed25519_verify(&pairing.public_key, &info[..info_len], &signature).is_err() {
        info!("Pair Verify M3: controller signature is invalid");
        session.pair_verify.error = Some(PairingError::Authentication);
        return Ok(());
    }

    session.pair_verify.pairing_slot = Some(slot);
    Ok(())
}

fn get_m4<C: PlatformConfig>(
    resources: &mut PairingResources<'_, C>,
    session: &mut Session,
    writer: &mut TlvWriter<'_>,
) -> Result<bool, HapError> {
    debug!("Pair Verify M4: Verify Finish Response");
    let slot = session.pair_verify.pairing_slot.ok_or(HapError::InvalidState)?;

    writer.append_u8(tlv_type::STATE, 4)?;

    let shared_secret = session.pair_verify.shared_secret;
    if session.transport == Transport::Ble {
        // Seed the resume cache so the controller can skip M3 next time.
        let mut session_id = [0; SESSION_ID_BYTES];
        crypto::hkdf_sha512(
            &mut session_id,
            &shared_secret,
            b"Pair-Verify-ResumeSessionID-Salt",
            b"Pair-Verify-ResumeSessionID-Info",
        );
        resources.session_cache.save(&session_id, &shared_secret, slot);
    }

    session.open(&shared_secret, slot);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::Identity;
    use crate::accessory::setup::{SetupCode, SetupInfoCache};
    use crate::pairing::cache::SessionCache;
    use crate::pairing::{Pairing, Permissions};
    use crate::platform::test::{MemoryStore, TestConfig, TestRng};
    use crate::platform::KeyValueStore;
    use crate::tlv::{TlvReader, TlvWriter};

    const CONTROLLER_ID: &[u8] = b"3B:9F:5A:30:00:01";

    struct Fixture {
        store: MemoryStore,
        rng: TestRng,
        identity: Identity,
        setup_code: SetupCode,
        setup_info: SetupInfoCache,
        session_cache: SessionCache,
        controller_ltsk: [u8; 32],
        controller_ltpk: [u8; 32],
    }

    impl Fixture {
        fn new() -> Self {
            let mut store = MemoryStore::new();
            let mut rng = TestRng(0xFEED);
            let identity = Identity::load_or_generate(&mut store, &mut rng).unwrap();

            let controller_ltsk = [0x21; 32];
            let controller_ltpk = crypto::ed25519_public_key(&controller_ltsk);
            let pairing =
                Pairing::new(CONTROLLER_ID, controller_ltpk, Permissions::ADMIN).unwrap();
            crate::pairing::PairingStore::set(&mut store, 0, &pairing).unwrap();

            Fixture {
                store,
                rng,
                identity,
                setup_code: SetupCode::new(b"518-08-582").unwrap(),
                setup_info: SetupInfoCache::new(),
                session_cache: SessionCache::new(),
                controller_ltsk,
                controller_ltpk,
            }
        }

        fn resources(&mut self) -> PairingResources<'_, TestConfig> {
            PairingResources {
                store: &mut self.store,
                rng: &mut self.rng,
                now: crate::time::Instant::from_raw_millis(0),
                auth: None,
                identity: &self.identity,
                setup_code: &self.setup_code,
                setup_info: &mut self.setup_info,
                session_cache: &mut self.session_cache,
            }
        }
    }

    /// Runs a full Pair Verify on `session`, returning the shared secret.
    fn run_pair_verify(fixture: &mut Fixture, session: &mut Session) -> [u8; 32] {
        let controller_sk = [0x44; 32];
        let controller_pk = crypto::x25519_scalarmult_base(&controller_sk);

        // M1.
        let mut m1 = [0; 64];
        let mut w = TlvWriter::new(&mut m1);
        w.append_u8(tlv_type::STATE, 1).unwrap();
        w.append(tlv_type::PUBLIC_KEY, &controller_pk).unwrap();
        let len = w.finish();
        handle_write(&mut fixture.resources(), session, &m1[..len]).unwrap();

        // M2.
        let mut m2 = [0; 512];
        let mut w = TlvWriter::new(&mut m2);
        handle_read(&mut fixture.resources(), session, &mut w).unwrap();
        let len = w.finish();

        let reader = TlvReader::new(&m2[..len]);
        assert_eq!(reader.expect(tlv_type::STATE).unwrap().parse_u8().unwrap(), 2);
        let accessory_pk_tlv = reader.expect(tlv_type::PUBLIC_KEY).unwrap();
        let mut accessory_pk = [0; 32];
        accessory_pk_tlv.copy_into(&mut accessory_pk).unwrap();

        let shared = crypto::x25519_scalarmult(&controller_sk, &accessory_pk);
        let mut session_key = [0; 32];
        crypto::hkdf_sha512(
            &mut session_key,
            &shared,
            b"Pair-Verify-Encrypt-Salt",
            b"Pair-Verify-Encrypt-Info",
        );

        // Decrypt and check the accessory sub-TLV.
        let encrypted = reader.expect(tlv_type::ENCRYPTED_DATA).unwrap();
        let mut enc = vec![0; encrypted.len()];
        encrypted.copy_into(&mut enc).unwrap();
        let tag_at = enc.len() - 16;
        let mut tag = [0; 16];
        tag.copy_from_slice(&enc[tag_at..]);
        crypto::chacha20_poly1305_decrypt(
            &session_key,
            &crypto::nonce_from_label(b"PV-Msg02"),
            &[],
            &mut enc[..tag_at],
            &tag,
        )
        .unwrap();

        let sub = TlvReader::new(&enc[..tag_at]);
        let id = sub.expect(tlv_type::IDENTIFIER).unwrap();
        assert_eq!(id.len(), 17);
        let sig_tlv = sub.expect(tlv_type::SIGNATURE).unwrap();
        let mut sig = [0; 64];
        sig_tlv.copy_into(&mut sig).unwrap();

        let device_id = fixture.identity.device_id.to_string_bytes();
        let mut info = [0; 81];
        info[..32].copy_from_slice(&accessory_pk);
        info[32..49].copy_from_slice(&device_id);
        info[49..].copy_from_slice(&controller_pk);
        crypto::ed25519_verify(&fixture.identity.ed_ltpk, &info, &sig).unwrap();

        // M3: prove the controller's identity.
        let mut info = [0; 81];
        info[..32].copy_from_slice(&controller_pk);
        info[32..49].copy_from_slice(CONTROLLER_ID);
        info[49..].copy_from_slice(&accessory_pk);
        let sig =
            crypto::ed25519_sign(&fixture.controller_ltsk, &fixture.controller_ltpk, &info);

        let mut sub_buf = [0; 128];
        let mut sub = TlvWriter::new(&mut sub_buf);
        sub.append(tlv_type::IDENTIFIER, CONTROLLER_ID).unwrap();
        sub.append(tlv_type::SIGNATURE, &sig).unwrap();
        let sub_len = sub.finish();
        let tag = crypto::chacha20_poly1305_encrypt(
            &session_key,
            &crypto::nonce_from_label(b"PV-Msg03"),
            &[],
            &mut sub_buf[..sub_len],
        );
        sub_buf[sub_len..sub_len + 16].copy_from_slice(&tag);

        let mut m3 = [0; 256];
        let mut w = TlvWriter::new(&mut m3);
        w.append_u8(tlv_type::STATE, 3).unwrap();
        w.append(tlv_type::ENCRYPTED_DATA, &sub_buf[..sub_len + 16])
            .unwrap();
        let len = w.finish();
        handle_write(&mut fixture.resources(), session, &m3[..len]).unwrap();

        // M4.
        let mut m4 = [0; 64];
        let mut w = TlvWriter::new(&mut m4);
        handle_read(&mut fixture.resources(), session, &mut w).unwrap();
        let len = w.finish();
        let reader = TlvReader::new(&m4[..len]);
        assert_eq!(reader.expect(tlv_type::STATE).unwrap().parse_u8().unwrap(), 4);
        assert!(reader.find(tlv_type::ERROR).is_none());

        shared
    }

    #[test]
    fn full_verify_opens_session() {
        let mut fixture = Fixture::new();
        let mut session = Session::new(Transport::Ip);
        run_pair_verify(&mut fixture, &mut session);
        assert!(session.is_active());
        assert_eq!(session.pairing_slot, Some(0));
        assert_eq!(session.outbound_nonce(), Some(0));
    }

    #[test]
    fn unknown_controller_fails_m3() {
        let mut fixture = Fixture::new();
        fixture.store.purge_domain(crate::platform::Domain::Pairings).unwrap();
        let mut session = Session::new(Transport::Ip);

        let controller_sk = [0x44; 32];
        let controller_pk = crypto::x25519_scalarmult_base(&controller_sk);
        let mut m1 = [0; 64];
        let mut w = TlvWriter::new(&mut m1);
        w.append_u8(tlv_type::STATE, 1).unwrap();
        w.append(tlv_type::PUBLIC_KEY, &controller_pk).unwrap();
        let len = w.finish();
        handle_write(&mut fixture.resources(), &mut session, &m1[..len]).unwrap();

        let mut m2 = [0; 512];
        let mut w = TlvWriter::new(&mut m2);
        handle_read(&mut fixture.resources(), &mut session, &mut w).unwrap();
        let len = w.finish();
        let reader = TlvReader::new(&m2[..len]);
        let accessory_pk_tlv = reader.expect(tlv_type::PUBLIC_KEY).unwrap();
        let mut accessory_pk = [0; 32];
        accessory_pk_tlv.copy_into(&mut accessory_pk).unwrap();

        let shared = crypto::x25519_scalarmult(&controller_sk, &accessory_pk);
        let mut session_key = [0; 32];
        crypto::hkdf_sha512(
            &mut session_key,
            &shared,
            b"Pair-Verify-Encrypt-Salt",
            b"Pair-Verify-Encrypt-Info",
        );

        let mut info = [0; 81];
        info[..32].copy_from_slice(&controller_pk);
        info[32..49].copy_from_slice(CONTROLLER_ID);
        info[49..].copy_from_slice(&accessory_pk);
        let sig =
            crypto::ed25519_sign(&fixture.controller_ltsk, &fixture.controller_ltpk, &info);

        let mut sub_buf = [0; 128];
        let mut sub = TlvWriter::new(&mut sub_buf);
        sub.append(tlv_type::IDENTIFIER, CONTROLLER_ID).unwrap();
        sub.append(tlv_type::SIGNATURE, &sig).unwrap();
        let sub_len = sub.finish();
        let tag = crypto::chacha20_poly1305_encrypt(
            &session_key,
            &crypto::nonce_from_label(b"PV-Msg03"),
            &[],
            &mut sub_buf[..sub_len],
        );
        sub_buf[sub_len..sub_len + 16].copy_from_slice(&tag);

        let mut m3 = [0; 256];
        let mut w = TlvWriter::new(&mut m3);
        w.append_u8(tlv_type::STATE, 3).unwrap();
        w.append(tlv_type::ENCRYPTED_DATA, &sub_buf[..sub_len + 16])
            .unwrap();
        let len = w.finish();
        handle_write(&mut fixture.resources(), &mut session, &m3[..len]).unwrap();

        let mut m4 = [0; 64];
        let mut w = TlvWriter::new(&mut m4);
        handle_read(&mut fixture.resources(), &mut session, &mut w).unwrap();
        let len = w.finish();
        let reader = TlvReader::new(&m4[..len]);
        assert_eq!(
            reader.expect(tlv_type::ERROR).unwrap().parse_u8().unwrap(),
            u8::from(PairingError::Authentication)
        );
        assert!(!session.is_active());
    }

    #[test]
    fn ble_verify_seeds_resume_cache_and_resume_works() {
        let mut fixture = Fixture::new();
        let mut session = Session::new(Transport::Ble);
        let shared = run_pair_verify(&mut fixture, &mut session);
        assert!(session.is_active());

        // The controller derives the resume session id the same way the accessory did.
        let mut session_id = [0; SESSION_ID_BYTES];
        crypto::hkdf_sha512(
            &mut session_id,
            &shared,
            b"Pair-Verify-ResumeSessionID-Salt",
            b"Pair-Verify-ResumeSessionID-Info",
        );

        // Reconnect: fresh session, resume M1.
        let mut session = Session::new(Transport::Ble);
        let controller_sk = [0x99; 32];
        let controller_pk = crypto::x25519_scalarmult_base(&controller_sk);

        let mut salt = [0; 40];
        salt[..32].copy_from_slice(&controller_pk);
        salt[32..].copy_from_slice(&session_id);
        let mut request_key = [0; 32];
        crypto::hkdf_sha512(&mut request_key, &shared, &salt, b"Pair-Resume-Request-Info");
        let mut empty = [0u8; 0];
        let request_tag = crypto::chacha20_poly1305_encrypt(
            &request_key,
            &crypto::nonce_from_label(b"PR-Msg01"),
            &[],
            &mut empty,
        );

        let mut m1 = [0; 128];
        let mut w = TlvWriter::new(&mut m1);
        w.append_u8(tlv_type::STATE, 1).unwrap();
        w.append_u8(tlv_type::METHOD, Method::PairResume.into()).unwrap();
        w.append(tlv_type::PUBLIC_KEY, &controller_pk).unwrap();
        w.append(tlv_type::SESSION_ID, &session_id).unwrap();
        w.append(tlv_type::ENCRYPTED_DATA, &request_tag).unwrap();
        let len = w.finish();
        handle_write(&mut fixture.resources(), &mut session, &m1[..len]).unwrap();

        let mut m2 = [0; 128];
        let mut w = TlvWriter::new(&mut m2);
        handle_read(&mut fixture.resources(), &mut session, &mut w).unwrap();
        let len = w.finish();

        let reader = TlvReader::new(&m2[..len]);
        assert_eq!(reader.expect(tlv_type::STATE).unwrap().parse_u8().unwrap(), 2);
        assert_eq!(
            reader.expect(tlv_type::METHOD).unwrap().parse_u8().unwrap(),
            u8::from(Method::PairResume)
        );
        let new_id_tlv = reader.expect(tlv_type::SESSION_ID).unwrap();
        let mut new_id = [0; SESSION_ID_BYTES];
        new_id_tlv.copy_into(&mut new_id).unwrap();
        assert_ne!(new_id, session_id);

        // Check the response tag.
        salt[32..].copy_from_slice(&new_id);
        let mut response_key = [0; 32];
        crypto::hkdf_sha512(&mut response_key, &shared, &salt, b"Pair-Resume-Response-Info");
        let tag_tlv = reader.expect(tlv_type::ENCRYPTED_DATA).unwrap();
        let mut tag = [0; 16];
        tag_tlv.copy_into(&mut tag).unwrap();
        let mut empty = [0u8; 0];
        crypto::chacha20_poly1305_decrypt(
            &response_key,
            &crypto::nonce_from_label(b"PR-Msg02"),
            &[],
            &mut empty,
            &tag,
        )
        .unwrap();

        // The session is live without M3/M4.
        assert!(session.is_active());
        assert_eq!(session.pairing_slot, Some(0));

        // The old session id was consumed.
        assert!(fixture.session_cache.take(&session_id).is_none());
        // The new one is cached.
        assert!(fixture.session_cache.take(&new_id).is_some());
    }

    #[test]
    fn resume_with_unknown_id_downgrades() {
        let mut fixture = Fixture::new();
        let mut session = Session::new(Transport::Ble);

        let controller_sk = [0x44; 32];
        let controller_pk = crypto::x25519_scalarmult_base(&controller_sk);
        let request_tag = [0; 16];

        let mut m1 = [0; 128];
        let mut w = TlvWriter::new(&mut m1);
        w.append_u8(tlv_type::STATE, 1).unwrap();
        w.append_u8(tlv_type::METHOD, Method::PairResume.into()).unwrap();
        w.append(tlv_type::PUBLIC_KEY, &controller_pk).unwrap();
        w.append(tlv_type::SESSION_ID, &[7; 8]).unwrap();
        w.append(tlv_type::ENCRYPTED_DATA, &request_tag).unwrap();
        let len = w.finish();
        handle_write(&mut fixture.resources(), &mut session, &m1[..len]).unwrap();

        let mut m2 = [0; 512];
        let mut w = TlvWriter::new(&mut m2);
        handle_read(&mut fixture.resources(), &mut session, &mut w).unwrap();
        let len = w.finish();

        // Downgraded: a Pair Verify M2 with a public key, no session id.
        let reader = TlvReader::new(&m2[..len]);
        assert!(reader.find(tlv_type::SESSION_ID).is_none());
        assert!(reader.find(tlv_type::PUBLIC_KEY).is_some());
        assert!(!session.is_active());
    }

    #[test]
    fn new_m1_discards_active_session() {
        let mut fixture = Fixture::new();
        let mut session = Session::new(Transport::Ip);
        run_pair_verify(&mut fixture, &mut session);
        assert!(session.is_active());

        let controller_pk = crypto::x25519_scalarmult_base(&[0x55; 32]);
        let mut m1 = [0; 64];
        let mut w = TlvWriter::new(&mut m1);
        w.append_u8(tlv_type::STATE, 1).unwrap();
        w.append(tlv_type::PUBLIC_KEY, &controller_pk).unwrap();
        let len = w.finish();
        handle_write(&mut fixture.resources(), &mut session, &m1[..len]).unwrap();
        assert!(!session.is_active());
    }
}
