//! The accessory server: lifecycle, session registry, pairing management and the glue between
//! transports and the engines.
//!
//! The server owns the platform capabilities, the accessory identity, the pairing engines'
//! server-wide state (the Pair Setup claim, the resume cache) and one slot per connected
//! controller. All mutation happens on the single run-loop thread; there is no interior
//! locking anywhere.

use core::array;

use crate::accessory::setup::{
    SetupCode, SetupFlags, SetupId, SetupInfoCache, SetupPayload,
};
use crate::accessory::{Category, Identity};
use crate::ble::procedure::{self, TimedWrite};
use crate::ble::transaction::Transaction;
use crate::ble::broadcast;
use crate::characteristic::{Accessory, Delegate, Properties};
use crate::event;
use crate::pairing::cache::SessionCache;
use crate::pairing::pair_setup::PairSetup;
use crate::pairing::{
    pair_verify, tlv_type, Method, Pairing, PairingError, PairingResources, PairingStore,
    Permissions,
};
use crate::platform::{config_key, Clock, Domain, KeyValueStore, Platform, PlatformConfig};
use crate::session::{Session, Transport};
use crate::tlv::{TlvReader, TlvWriter};
use crate::HapError;

/// Connected controllers per server.
pub const MAX_SESSIONS: usize = 8;

/// Server lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopping,
}

/// Opaque reference to a connected session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionHandle(usize);

/// The accessory server.
pub struct AccessoryServer<C: PlatformConfig, D: Delegate> {
    platform: Platform<C>,
    state: State,
    identity: Option<Identity>,
    accessory: &'static Accessory,
    delegate: D,
    setup_code: SetupCode,
    setup_id: SetupId,
    category: Category,
    setup_info: SetupInfoCache,
    pair_setup: PairSetup,
    session_cache: SessionCache,
    sessions: [Option<Session>; MAX_SESSIONS],
    event_queues: [event::Queue; MAX_SESSIONS],
    timed_writes: [Option<TimedWrite>; MAX_SESSIONS],
}

impl<C: PlatformConfig, D: Delegate> AccessoryServer<C, D> {
    pub fn new(
        platform: Platform<C>,
        accessory: &'static Accessory,
        delegate: D,
        setup_code: SetupCode,
        setup_id: SetupId,
        category: Category,
    ) -> Self {
        AccessoryServer {
            platform,
            state: State::Idle,
            identity: None,
            accessory,
            delegate,
            setup_code,
            setup_id,
            category,
            setup_info: SetupInfoCache::new(),
            pair_setup: PairSetup::new(),
            session_cache: SessionCache::new(),
            sessions: array::from_fn(|_| None),
            event_queues: array::from_fn(|_| event::Queue::new()),
            timed_writes: array::from_fn(|_| None),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Binds the store and materializes the identity; transports may accept connections once
    /// this returns.
    pub fn start(&mut self) -> Result<(), HapError> {
        if self.state != State::Idle {
            return Err(HapError::InvalidState);
        }
        let identity =
            Identity::load_or_generate(&mut self.platform.store, &mut self.platform.rng)?;
        info!("accessory server starting as {}", identity.device_id);
        self.identity = Some(identity);
        self.state = State::Running;
        Ok(())
    }

    /// Begins shutdown. Sessions whose responses have flushed are dropped; once all are gone
    /// the server returns to `Idle`.
    pub fn stop(&mut self) {
        if self.state != State::Running {
            return;
        }
        self.state = State::Stopping;
        self.poll_stop();
    }

    /// Drops flushed sessions during `Stopping`; returns `true` once idle.
    pub fn poll_stop(&mut self) -> bool {
        if self.state != State::Stopping {
            return self.state == State::Idle;
        }
        for index in 0..MAX_SESSIONS {
            if self.sessions[index].is_some() && self.event_queues[index].is_empty() {
                self.drop_session(index);
            }
        }
        if self.sessions.iter().all(|s| s.is_none()) {
            self.state = State::Idle;
            true
        } else {
            false
        }
    }

    /// The accessory's long-term identity. Only available while running.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// The setup payload to render as QR code or NFC tag.
    pub fn setup_payload(&self, flags: SetupFlags) -> SetupPayload {
        SetupPayload::new(&self.setup_code, &self.setup_id, self.category, flags)
    }

    /// Accepts a new transport connection. `None` when all session slots are taken.
    pub fn accept_session(&mut self, transport: Transport) -> Option<SessionHandle> {
        if self.state != State::Running {
            return None;
        }
        for (index, slot) in self.sessions.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Session::new(transport));
                self.event_queues[index].clear();
                self.timed_writes[index] = None;
                return Some(SessionHandle(index));
            }
        }
        None
    }

    /// Handles a transport disconnect: the session and everything it owns goes away.
    pub fn close_session(&mut self, handle: SessionHandle) {
        self.drop_session(handle.0);
    }

    fn drop_session(&mut self, index: usize) {
        if let Some(session) = self.sessions[index].as_mut() {
            session.invalidate();
            let mut resources = pairing_resources(
                &mut self.platform,
                self.identity.as_ref(),
                &self.setup_code,
                &mut self.setup_info,
                &mut self.session_cache,
            );
            self.pair_setup.handle_session_invalidated(&mut resources, index);
        }
        self.sessions[index] = None;
        self.event_queues[index].clear();
        self.timed_writes[index] = None;
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions[handle.0].as_ref()
    }

    // ---- Pairing endpoints -------------------------------------------------------------

    /// `POST /pair-setup` request body (or a write to the Pair Setup characteristic).
    pub fn pair_setup_write(
        &mut self,
        handle: SessionHandle,
        body: &[u8],
    ) -> Result<(), HapError> {
        let session = self.sessions[handle.0].as_mut().ok_or(HapError::InvalidState)?;
        let mut resources = pairing_resources(
            &mut self.platform,
            self.identity.as_ref(),
            &self.setup_code,
            &mut self.setup_info,
            &mut self.session_cache,
        );
        self.pair_setup
            .handle_write(&mut resources, handle.0, session, body)
    }

    /// Produces the next Pair Setup response into `out`, returning its length.
    pub fn pair_setup_read(
        &mut self,
        handle: SessionHandle,
        out: &mut [u8],
    ) -> Result<usize, HapError> {
        let session = self.sessions[handle.0].as_mut().ok_or(HapError::InvalidState)?;
        let mut resources = pairing_resources(
            &mut self.platform,
            self.identity.as_ref(),
            &self.setup_code,
            &mut self.setup_info,
            &mut self.session_cache,
        );
        let mut writer = TlvWriter::new(out);
        self.pair_setup
            .handle_read(&mut resources, handle.0, session, &mut writer)?;
        Ok(writer.finish())
    }

    /// `POST /pair-verify` request body.
    pub fn pair_verify_write(
        &mut self,
        handle: SessionHandle,
        body: &[u8],
    ) -> Result<(), HapError> {
        let session = self.sessions[handle.0].as_mut().ok_or(HapError::InvalidState)?;
        let mut resources = pairing_resources(
            &mut self.platform,
            self.identity.as_ref(),
            &self.setup_code,
            &mut self.setup_info,
            &mut self.session_cache,
        );
        pair_verify::handle_write(&mut resources, session, body)
    }

    /// Produces the next Pair Verify response into `out`, returning its length.
    pub fn pair_verify_read(
        &mut self,
        handle: SessionHandle,
        out: &mut [u8],
    ) -> Result<usize, HapError> {
        let session = self.sessions[handle.0].as_mut().ok_or(HapError::InvalidState)?;
        let mut resources = pairing_resources(
            &mut self.platform,
            self.identity.as_ref(),
            &self.setup_code,
            &mut self.setup_info,
            &mut self.session_cache,
        );
        let mut writer = TlvWriter::new(out);
        pair_verify::handle_read(&mut resources, session, &mut writer)?;
        Ok(writer.finish())
    }

    /// `POST /pairings`: add, remove and list pairings. Admin only.
    ///
    /// The response (state + optional error, or the pairing list) is written into `out`.
    pub fn pairings_request(
        &mut self,
        handle: SessionHandle,
        body: &[u8],
        out: &mut [u8],
    ) -> Result<usize, HapError> {
        let mut writer = TlvWriter::new(out);
        let error = self.process_pairings_request(handle, body, &mut writer)?;
        if let Some(error) = error {
            writer.append_u8(tlv_type::STATE, 2)?;
            writer.append_u8(tlv_type::ERROR, error.into())?;
        }
        Ok(writer.finish())
    }

    fn process_pairings_request(
        &mut self,
        handle: SessionHandle,
        body: &[u8],
        writer: &mut TlvWriter<'_>,
    ) -> Result<Option<PairingError>, HapError> {
        let reader = TlvReader::new(body);
        reader.validate().map_err(|_| HapError::InvalidData)?;
        let state = reader
            .expect(tlv_type::STATE)
            .and_then(|v| v.parse_u8())
            .map_err(|_| HapError::InvalidData)?;
        if state != 1 {
            return Err(HapError::InvalidData);
        }
        let method = reader
            .expect(tlv_type::METHOD)
            .and_then(|v| v.parse_u8())
            .map(Method::from)
            .map_err(|_| HapError::InvalidData)?;

        // All three operations require an admin controller on a verified session.
        let session = self.sessions[handle.0].as_ref().ok_or(HapError::InvalidState)?;
        let admin = match (session.is_active(), session.transient, session.pairing_slot) {
            (true, false, Some(slot)) => PairingStore::get(&self.platform.store, slot)?
                .map(|p| p.is_admin())
                .unwrap_or(false),
            _ => false,
        };
        if !admin {
            info!("pairings request from non-admin controller");
            return Ok(Some(PairingError::Authentication));
        }

        match method {
            Method::AddPairing => self.add_pairing(&reader, writer),
            Method::RemovePairing => self.remove_pairing(&reader, writer),
            Method::ListPairings => self.list_pairings(writer),
            _ => Err(HapError::InvalidData),
        }
    }

    fn add_pairing(
        &mut self,
        reader: &TlvReader<'_>,
        writer: &mut TlvWriter<'_>,
    ) -> Result<Option<PairingError>, HapError> {
        let identifier_tlv = reader
            .expect(tlv_type::IDENTIFIER)
            .map_err(|_| HapError::InvalidData)?;
        let mut identifier = [0; crate::pairing::MAX_IDENTIFIER_BYTES];
        if identifier_tlv.is_empty() || identifier_tlv.len() > identifier.len() {
            return Err(HapError::InvalidData);
        }
        let identifier = identifier_tlv
            .copy_into(&mut identifier)
            .map_err(|_| HapError::InvalidData)?;

        let ltpk_tlv = reader
            .expect(tlv_type::PUBLIC_KEY)
            .map_err(|_| HapError::InvalidData)?;
        let mut ltpk = [0; 32];
        if ltpk_tlv.len() != 32 {
            return Err(HapError::InvalidData);
        }
        ltpk_tlv.copy_into(&mut ltpk).map_err(|_| HapError::InvalidData)?;

        let permissions = reader
            .expect(tlv_type::PERMISSIONS)
            .and_then(|v| v.parse_u8())
            .map(Permissions::from_bits_truncate)
            .map_err(|_| HapError::InvalidData)?;

        match PairingStore::find(&self.platform.store, identifier)? {
            Some((slot, existing)) => {
                if existing.public_key != ltpk {
                    // Same identifier, different key: refuse rather than silently rebind.
                    return Ok(Some(PairingError::Unknown));
                }
                let updated = Pairing::new(identifier, ltpk, permissions)?;
                PairingStore::set(&mut self.platform.store, slot, &updated)?;
            }
            None => match PairingStore::free_slot(&self.platform.store)? {
                None => return Ok(Some(PairingError::MaxPeers)),
                Some(slot) => {
                    let pairing = Pairing::new(identifier, ltpk, permissions)?;
                    PairingStore::set(&mut self.platform.store, slot, &pairing)?;
                }
            },
        }
        writer.append_u8(tlv_type::STATE, 2)?;
        Ok(None)
    }

    fn remove_pairing(
        &mut self,
        reader: &TlvReader<'_>,
        writer: &mut TlvWriter<'_>,
    ) -> Result<Option<PairingError>, HapError> {
        let identifier_tlv = reader
            .expect(tlv_type::IDENTIFIER)
            .map_err(|_| HapError::InvalidData)?;
        let mut identifier = [0; crate::pairing::MAX_IDENTIFIER_BYTES];
        if identifier_tlv.is_empty() || identifier_tlv.len() > identifier.len() {
            return Err(HapError::InvalidData);
        }
        let identifier = identifier_tlv
            .copy_into(&mut identifier)
            .map_err(|_| HapError::InvalidData)?;

        if let Some((slot, removed)) = PairingStore::find(&self.platform.store, identifier)? {
            self.purge_pairing_slot(slot)?;

            // The last admin takes every remaining pairing with it; a pairing set without an
            // admin is unreachable.
            if removed.is_admin() && !PairingStore::any_admin(&self.platform.store)? {
                info!("last admin removed, dropping all pairings");
                let mut slots = [0u8; crate::pairing::MAX_PAIRINGS as usize];
                let mut count = 0;
                PairingStore::for_each(&self.platform.store, |slot, _| {
                    slots[count] = slot;
                    count += 1;
                    Ok(true)
                })?;
                for slot in &slots[..count] {
                    self.purge_pairing_slot(*slot)?;
                }
            }
        }

        writer.append_u8(tlv_type::STATE, 2)?;
        Ok(None)
    }

    /// Removes one pairing slot and everything hanging off it: sessions verified against it
    /// and resume-cache entries bound to it.
    fn purge_pairing_slot(&mut self, slot: u8) -> Result<(), HapError> {
        for index in 0..MAX_SESSIONS {
            let invalidate = self.sessions[index]
                .as_ref()
                .map(|s| s.pairing_slot == Some(slot))
                .unwrap_or(false);
            if invalidate {
                if let Some(session) = self.sessions[index].as_mut() {
                    session.invalidate();
                }
                self.event_queues[index].clear();
                self.timed_writes[index] = None;
            }
        }
        self.session_cache.invalidate_pairing(slot);
        PairingStore::remove(&mut self.platform.store, slot)
    }

    fn list_pairings(
        &mut self,
        writer: &mut TlvWriter<'_>,
    ) -> Result<Option<PairingError>, HapError> {
        writer.append_u8(tlv_type::STATE, 2)?;
        let mut first = true;
        let mut result = Ok(());
        PairingStore::for_each(&self.platform.store, |_, pairing| {
            if !first {
                if let Err(e) = writer.append_separator(tlv_type::SEPARATOR) {
                    result = Err(e);
                    return Ok(false);
                }
            }
            first = false;
            let append = writer
                .append(tlv_type::IDENTIFIER, pairing.identifier())
                .and_then(|_| writer.append(tlv_type::PUBLIC_KEY, &pairing.public_key))
                .and_then(|_| writer.append_u8(tlv_type::PERMISSIONS, pairing.permissions.bits()));
            if let Err(e) = append {
                result = Err(e);
                return Ok(false);
            }
            Ok(true)
        })?;
        result.map_err(|_| HapError::OutOfResources)?;
        Ok(None)
    }

    // ---- Characteristic access ----------------------------------------------------------

    /// Runs the BLE procedure dispatcher for a completed transaction on `handle`.
    pub fn ble_handle_request(
        &mut self,
        handle: SessionHandle,
        tx: &mut Transaction<'_>,
    ) -> Result<(), HapError> {
        let now = self.platform.clock.now();
        let gsn = self.gsn()?;
        let config_number = self.config_number()?;
        let advertising_id =
            broadcast::advertising_id(&mut self.platform.store, &mut self.platform.rng)?;
        let session = self.sessions[handle.0].as_mut().ok_or(HapError::InvalidState)?;

        let mut ctx = procedure::Context::<C, D> {
            store: &mut self.platform.store,
            now,
            accessory: self.accessory,
            session,
            delegate: &mut self.delegate,
            timed_write: &mut self.timed_writes[handle.0],
            gsn,
            config_number,
            advertising_id,
        };
        procedure::dispatch(&mut ctx, tx)
    }

    /// Subscribes `handle` to a characteristic's notifications.
    pub fn subscribe(&mut self, handle: SessionHandle, iid: u64) -> Result<(), HapError> {
        let session = self.sessions[handle.0].as_mut().ok_or(HapError::InvalidState)?;
        event::subscribe(self.accessory, session, iid, &mut self.delegate)
    }

    /// Drops `handle`'s subscription.
    pub fn unsubscribe(&mut self, handle: SessionHandle, iid: u64) -> Result<(), HapError> {
        let session = self.sessions[handle.0].as_mut().ok_or(HapError::InvalidState)?;
        event::unsubscribe(self.accessory, session, iid, &mut self.delegate)
    }

    /// Raises a characteristic event, queueing a notification for every subscriber.
    ///
    /// Fan-out is [`event::raise`]; on top of it, characteristics that notify disconnected
    /// controllers bump the BLE GSN so that the next advertisement reflects the change.
    ///
    /// [`event::raise`]: ../event/fn.raise.html
    pub fn raise_event(&mut self, iid: u64) -> Result<usize, HapError> {
        let subscribers = self
            .sessions
            .iter()
            .zip(self.event_queues.iter_mut())
            .filter_map(|(slot, queue)| slot.as_ref().map(|session| (session, queue)));
        let notified = event::raise(self.accessory, iid, subscribers)?;

        let bumps_gsn = self
            .accessory
            .characteristic(iid)
            .map(|(_, c)| {
                c.properties.intersects(
                    Properties::SUPPORTS_DISCONNECTED_NOTIFICATION
                        | Properties::SUPPORTS_BROADCAST_NOTIFICATION,
                )
            })
            .unwrap_or(false);
        if bumps_gsn {
            self.increment_gsn()?;
        }
        Ok(notified)
    }

    /// Dequeues the next pending event notification for `handle`.
    pub fn next_event(&mut self, handle: SessionHandle) -> Option<u64> {
        self.event_queues[handle.0].pop()
    }

    // ---- Counters and global state ------------------------------------------------------

    /// The BLE Global State Number.
    pub fn gsn(&self) -> Result<u16, HapError> {
        let mut buf = [0; 2];
        match self.platform.store.get(
            Domain::Configuration,
            config_key::GLOBAL_STATE_NUMBER,
            &mut buf,
        )? {
            Some(bytes) if bytes.len() == 2 => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
            Some(_) => Err(HapError::Unknown),
            None => Ok(1),
        }
    }

    fn increment_gsn(&mut self) -> Result<(), HapError> {
        let gsn = self.gsn()?;
        let next = if gsn == u16::max_value() { 1 } else { gsn + 1 };
        self.platform.store.set(
            Domain::Configuration,
            config_key::GLOBAL_STATE_NUMBER,
            &next.to_le_bytes(),
        )
    }

    /// The configuration number (CN), bumped whenever the attribute database changes.
    pub fn config_number(&self) -> Result<u8, HapError> {
        let mut buf = [0; 4];
        match self.platform.store.get(
            Domain::Configuration,
            config_key::CONFIGURATION_NUMBER,
            &mut buf,
        )? {
            Some(bytes) if bytes.len() == 4 => Ok(bytes[0]),
            Some(_) => Err(HapError::Unknown),
            None => Ok(1),
        }
    }

    /// Firmware-update hook: bumps CN, resets the GSN and expires the broadcast key.
    pub fn firmware_updated(&mut self) -> Result<(), HapError> {
        let cn = self.config_number()?;
        let next = if cn == u8::max_value() { 1 } else { cn + 1 };
        self.platform.store.set(
            Domain::Configuration,
            config_key::CONFIGURATION_NUMBER,
            &u32::from(next).to_le_bytes(),
        )?;
        self.platform.store.set(
            Domain::Configuration,
            config_key::GLOBAL_STATE_NUMBER,
            &1u16.to_le_bytes(),
        )?;
        broadcast::expire_key(&mut self.platform.store)?;
        info!("firmware update recorded, CN {}", next);
        Ok(())
    }

    /// Restores factory settings: all three storage domains are purged, every session dies,
    /// and the next start generates a fresh identity.
    pub fn restore_factory_settings(&mut self) -> Result<(), HapError> {
        info!("restoring factory settings");
        for index in 0..MAX_SESSIONS {
            self.drop_session(index);
        }
        self.session_cache.clear();
        self.setup_info.reset(false);

        self.platform.store.purge_domain(Domain::Configuration)?;
        self.platform.store.purge_domain(Domain::Pairings)?;
        self.platform
            .store
            .purge_domain(Domain::CharacteristicConfiguration)?;

        self.identity = None;
        self.state = State::Idle;
        Ok(())
    }

    /// Whether any controller is paired.
    pub fn is_paired(&self) -> Result<bool, HapError> {
        PairingStore::any(&self.platform.store)
    }

    #[cfg(test)]
    pub(crate) fn platform_mut(&mut self) -> &mut Platform<C> {
        &mut self.platform
    }

    #[cfg(test)]
    pub(crate) fn clock(&self) -> &C::Clock {
        &self.platform.clock
    }
}

/// Builds the borrowed resource bundle the pairing engines work with.
fn pairing_resources<'a, C: PlatformConfig>(
    platform: &'a mut Platform<C>,
    identity: Option<&'a Identity>,
    setup_code: &'a SetupCode,
    setup_info: &'a mut SetupInfoCache,
    session_cache: &'a mut SessionCache,
) -> PairingResources<'a, C> {
    let now = platform.clock.now();
    PairingResources {
        store: &mut platform.store,
        rng: &mut platform.rng,
        now,
        auth: platform.auth.as_ref(),
        identity: identity.expect("server not started"),
        setup_code,
        setup_info,
        session_cache,
    }
}
