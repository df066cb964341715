//! The BLE Pair Resume session cache.
//!
//! Pair Resume lets a controller that recently held a verified session re-establish encryption
//! with a single round trip. The accessory remembers `(session id, shared secret, pairing
//! slot)` tuples in a small least-recently-used cache; each entry is consumed by the resume
//! attempt that references it, successful or not.

use crate::utils::HexSlice;
use core::fmt;

/// Bytes in a resume session id.
pub const SESSION_ID_BYTES: usize = 8;

/// Number of cache entries.
pub const CACHE_ENTRIES: usize = 8;

#[derive(Copy, Clone)]
struct Entry {
    session_id: [u8; SESSION_ID_BYTES],
    shared_secret: [u8; 32],
    pairing_slot: u8,
    /// 0: invalid, > 0: recency stamp.
    last_used: u32,
}

const EMPTY: Entry = Entry {
    session_id: [0; SESSION_ID_BYTES],
    shared_secret: [0; 32],
    pairing_slot: 0,
    last_used: 0,
};

/// Bounded LRU of resumable sessions.
pub struct SessionCache {
    entries: [Entry; CACHE_ENTRIES],
    stamp: u32,
}

impl SessionCache {
    pub const fn new() -> Self {
        SessionCache {
            entries: [EMPTY; CACHE_ENTRIES],
            stamp: 0,
        }
    }

    /// Looks up and *removes* the entry for `session_id`.
    ///
    /// Resume attempts consume their cache entry whether or not the request tag verifies, so a
    /// replayed resume request can never hit the cache twice.
    pub fn take(&mut self, session_id: &[u8; SESSION_ID_BYTES]) -> Option<([u8; 32], u8)> {
        for entry in self.entries.iter_mut() {
            if entry.last_used != 0 && entry.session_id == *session_id {
                let result = (entry.shared_secret, entry.pairing_slot);
                *entry = EMPTY;
                return Some(result);
            }
        }
        None
    }

    /// Saves a resumable session, evicting the least recently used entry when full.
    pub fn save(
        &mut self,
        session_id: &[u8; SESSION_ID_BYTES],
        shared_secret: &[u8; 32],
        pairing_slot: u8,
    ) {
        let mut index = 0;
        let mut min = u32::max_value();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.last_used < min {
                min = entry.last_used;
                index = i;
            }
        }

        // Advance the recency stamp; on wrap, renumber live entries so ordering survives.
        self.stamp += 1;
        if self.stamp == 0 {
            for entry in self.entries.iter_mut() {
                if entry.last_used != 0 {
                    entry.last_used = 1;
                }
            }
            self.stamp = 2;
        }

        self.entries[index] = Entry {
            session_id: *session_id,
            shared_secret: *shared_secret,
            pairing_slot,
            last_used: self.stamp,
        };
    }

    /// Drops every entry bound to `pairing_slot`.
    ///
    /// There may be several (a pairing synced to multiple controllers).
    pub fn invalidate_pairing(&mut self, pairing_slot: u8) {
        for entry in self.entries.iter_mut() {
            if entry.last_used != 0 && entry.pairing_slot == pairing_slot {
                *entry = EMPTY;
            }
        }
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries = [EMPTY; CACHE_ENTRIES];
        self.stamp = 0;
    }

    #[cfg(test)]
    fn occupancy(&self) -> usize {
        self.entries.iter().filter(|e| e.last_used != 0).count()
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .filter(|e| e.last_used != 0)
                    .map(|e| (HexSlice(e.session_id), e.pairing_slot)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> [u8; SESSION_ID_BYTES] {
        [n; SESSION_ID_BYTES]
    }

    #[test]
    fn take_consumes_the_entry() {
        let mut cache = SessionCache::new();
        cache.save(&id(1), &[0xAA; 32], 3);
        assert_eq!(cache.take(&id(1)), Some(([0xAA; 32], 3)));
        assert_eq!(cache.take(&id(1)), None);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let mut cache = SessionCache::new();
        for n in 0..CACHE_ENTRIES as u8 {
            cache.save(&id(n), &[n; 32], n);
        }
        // Entry 0 is the oldest; saving one more evicts it.
        cache.save(&id(0xEE), &[0xEE; 32], 9);
        assert_eq!(cache.take(&id(0)), None);
        assert!(cache.take(&id(1)).is_some());
        assert!(cache.take(&id(0xEE)).is_some());
    }

    #[test]
    fn stamp_wrap_preserves_ordering() {
        let mut cache = SessionCache::new();
        cache.stamp = u32::max_value() - 1;
        cache.save(&id(1), &[1; 32], 1); // stamp == u32::MAX
        cache.save(&id(2), &[2; 32], 2); // wraps; live entries renumbered
        assert!(cache.entries.iter().all(|e| e.last_used <= 2));

        // Entry 1 must still be older than entry 2: filling the cache then adding one more
        // evicts entry 1 first.
        for n in 3..=CACHE_ENTRIES as u8 {
            cache.save(&id(n), &[n; 32], n);
        }
        cache.save(&id(0xEE), &[0; 32], 0);
        assert_eq!(cache.take(&id(1)), None);
        assert!(cache.take(&id(2)).is_some());
    }

    #[test]
    fn pairing_invalidation_drops_all_entries() {
        let mut cache = SessionCache::new();
        cache.save(&id(1), &[1; 32], 7);
        cache.save(&id(2), &[2; 32], 7);
        cache.save(&id(3), &[3; 32], 8);
        cache.invalidate_pairing(7);
        assert_eq!(cache.occupancy(), 1);
        assert!(cache.take(&id(3)).is_some());
    }
}
