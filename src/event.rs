//! Event notifications: per-session subscription tracking and fan-out.
//!
//! Subscriptions are kept as a bitset over characteristic ordinals inside each session. Raising
//! an event snapshots the subscribed sessions and enqueues one notification per subscriber; the
//! transport decides how the notification leaves the device (a GATT notification on BLE, an
//! `EVENT/1.0` record on IP). Notifications for the same characteristic coalesce while queued.

use heapless::Vec;

use crate::characteristic::{Accessory, Characteristic, Delegate};
use crate::session::Session;
use crate::HapError;

/// Maximum distinct characteristics with a queued notification per session.
pub const MAX_PENDING_EVENTS: usize = 16;

/// Status line of an IP event record; the characteristic payload follows as a body.
pub const IP_EVENT_STATUS_LINE: &[u8] = b"EVENT/1.0 200 OK";

/// Outbound notification queue of one session.
///
/// Entries are characteristic iids, oldest first, at most one per characteristic.
#[derive(Default)]
pub struct Queue {
    events: Vec<u64, MAX_PENDING_EVENTS>,
}

impl Queue {
    pub const fn new() -> Self {
        Queue { events: Vec::new() }
    }

    /// Enqueues a notification, coalescing with a queued one for the same characteristic.
    fn push(&mut self, iid: u64) -> Result<(), HapError> {
        if self.events.contains(&iid) {
            return Ok(());
        }
        self.events.push(iid).map_err(|_| HapError::OutOfResources)
    }

    /// Dequeues the next notification to deliver.
    pub fn pop(&mut self) -> Option<u64> {
        if self.events.is_empty() {
            return None;
        }
        let first = self.events[0];
        let len = self.events.len();
        for i in 1..len {
            self.events[i - 1] = self.events[i];
        }
        self.events.truncate(len - 1);
        Some(first)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drops all pending notifications (session invalidation).
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Subscribes `session` to a characteristic's notifications.
///
/// Subscribing is idempotent; the delegate only hears about the first subscription.
pub fn subscribe<D: Delegate>(
    accessory: &Accessory,
    session: &mut Session,
    iid: u64,
    delegate: &mut D,
) -> Result<(), HapError> {
    let (characteristic, ordinal) = lookup(accessory, iid)?;
    if session.subscriptions.insert(ordinal) {
        delegate.subscribe(accessory.aid, characteristic);
    }
    Ok(())
}

/// Drops `session`'s subscription to a characteristic.
pub fn unsubscribe<D: Delegate>(
    accessory: &Accessory,
    session: &mut Session,
    iid: u64,
    delegate: &mut D,
) -> Result<(), HapError> {
    let (characteristic, ordinal) = lookup(accessory, iid)?;
    if session.subscriptions.remove(ordinal) {
        delegate.unsubscribe(accessory.aid, characteristic);
    }
    Ok(())
}

fn lookup(accessory: &Accessory, iid: u64) -> Result<(&Characteristic, usize), HapError> {
    let ordinal = accessory.ordinal_of(iid).ok_or(HapError::InvalidData)?;
    if ordinal >= crate::session::SUBSCRIPTION_SET_BYTES * 8 {
        return Err(HapError::OutOfResources);
    }
    let (_, characteristic) = accessory.characteristic(iid).ok_or(HapError::InvalidData)?;
    Ok((characteristic, ordinal))
}

/// Raises an event for `(accessory, iid)`, fanning it out to every subscribed session.
///
/// `subscribers` pairs each live session with its notification queue; inactive and
/// unsubscribed sessions are skipped. Returns the number of sessions notified.
///
/// This is the fan-out only. Going through `AccessoryServer::raise_event` additionally bumps
/// the BLE GSN for characteristics that notify disconnected controllers; raise events through
/// the server unless that bookkeeping is handled elsewhere.
pub fn raise<'a>(
    accessory: &Accessory,
    iid: u64,
    subscribers: impl Iterator<Item = (&'a Session, &'a mut Queue)>,
) -> Result<usize, HapError> {
    let ordinal = accessory.ordinal_of(iid).ok_or(HapError::InvalidData)?;

    let mut notified = 0;
    for (session, queue) in subscribers {
        if session.is_active() && session.subscriptions.contains(ordinal) {
            queue.push(iid)?;
            notified += 1;
        }
    }
    Ok(notified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::{
        FormatSpec, Properties, Service, ServiceProperties, Unit, Value,
    };
    use crate::session::Transport;
    use crate::uuid::HapUuid;

    struct CountingDelegate {
        subscribes: usize,
        unsubscribes: usize,
    }

    impl Delegate for CountingDelegate {
        fn read<'a>(
            &'a mut self,
            _aid: u64,
            _characteristic: &Characteristic,
        ) -> Result<Value<'a>, HapError> {
            Ok(Value::Bool(false))
        }

        fn write(
            &mut self,
            _aid: u64,
            _characteristic: &Characteristic,
            _value: Value<'_>,
        ) -> Result<(), HapError> {
            Ok(())
        }

        fn subscribe(&mut self, _aid: u64, _characteristic: &Characteristic) {
            self.subscribes += 1;
        }

        fn unsubscribe(&mut self, _aid: u64, _characteristic: &Characteristic) {
            self.unsubscribes += 1;
        }
    }

    fn catalog() -> &'static Accessory {
        let characteristics: &'static [Characteristic] = Box::leak(Box::new([Characteristic {
            iid: 13,
            type_: HapUuid::apple_defined(0x25),
            properties: Properties::READABLE | Properties::SUPPORTS_EVENT_NOTIFICATION,
            unit: Unit::None,
            format: FormatSpec::Bool,
        }]));
        let services: &'static [Service] = Box::leak(Box::new([Service {
            iid: 10,
            type_: HapUuid::apple_defined(0x43),
            properties: ServiceProperties::PRIMARY,
            linked_services: &[],
            characteristics,
        }]));
        Box::leak(Box::new(Accessory { aid: 1, services }))
    }

    fn active_session() -> Session {
        let mut session = Session::new(Transport::Ip);
        session.open(&[1; 32], 0);
        session
    }

    #[test]
    fn subscribe_is_idempotent() {
        let accessory = catalog();
        let mut session = active_session();
        let mut delegate = CountingDelegate {
            subscribes: 0,
            unsubscribes: 0,
        };

        subscribe(accessory, &mut session, 13, &mut delegate).unwrap();
        subscribe(accessory, &mut session, 13, &mut delegate).unwrap();
        assert_eq!(delegate.subscribes, 1);

        unsubscribe(accessory, &mut session, 13, &mut delegate).unwrap();
        unsubscribe(accessory, &mut session, 13, &mut delegate).unwrap();
        assert_eq!(delegate.unsubscribes, 1);
    }

    #[test]
    fn fan_out_reaches_only_subscribers() {
        let accessory = catalog();
        let mut delegate = CountingDelegate {
            subscribes: 0,
            unsubscribes: 0,
        };

        let mut sessions = [active_session(), active_session(), active_session()];
        let mut queues = [Queue::new(), Queue::new(), Queue::new()];
        subscribe(accessory, &mut sessions[0], 13, &mut delegate).unwrap();
        subscribe(accessory, &mut sessions[1], 13, &mut delegate).unwrap();

        let notified = raise(accessory, 13, sessions.iter().zip(queues.iter_mut())).unwrap();
        assert_eq!(notified, 2);
        assert_eq!(queues[0].pop(), Some(13));
        assert_eq!(queues[1].pop(), Some(13));
        assert!(queues[2].is_empty());
        assert!(queues[0].is_empty());
    }

    #[test]
    fn events_coalesce_per_characteristic() {
        let accessory = catalog();
        let mut delegate = CountingDelegate {
            subscribes: 0,
            unsubscribes: 0,
        };
        let mut sessions = [active_session()];
        let mut queues = [Queue::new()];
        subscribe(accessory, &mut sessions[0], 13, &mut delegate).unwrap();

        raise(accessory, 13, sessions.iter().zip(queues.iter_mut())).unwrap();
        raise(accessory, 13, sessions.iter().zip(queues.iter_mut())).unwrap();
        assert_eq!(queues[0].len(), 1);
    }

    #[test]
    fn inactive_sessions_see_nothing() {
        let accessory = catalog();
        let mut delegate = CountingDelegate {
            subscribes: 0,
            unsubscribes: 0,
        };
        let mut sessions = [active_session()];
        let mut queues = [Queue::new()];
        subscribe(accessory, &mut sessions[0], 13, &mut delegate).unwrap();
        sessions[0].invalidate();

        let notified = raise(accessory, 13, sessions.iter().zip(queues.iter_mut())).unwrap();
        assert_eq!(notified, 0);
    }

    #[test]
    fn unknown_characteristic_is_rejected() {
        let accessory = catalog();
        let mut session = active_session();
        let mut delegate = CountingDelegate {
            subscribes: 0,
            unsubscribes: 0,
        };
        assert_eq!(
            subscribe(accessory, &mut session, 99, &mut delegate),
            Err(HapError::InvalidData)
        );
    }
}
