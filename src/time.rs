//! Time APIs for obtaining the current time and calculating with points in time and durations.
//!
//! These APIs are made for the accessory server and are not meant to be general-purpose. They have
//! millisecond resolution, matching the platform clock capability: only differences between two
//! [`Instant`]s are meaningful, the epoch is unspecified.
//!
//! [`Instant`]: struct.Instant.html

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with millisecond resolution.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u32);

impl Duration {
    /// How long a claim on the server-wide Pair Setup slot lasts before another session may
    /// preempt it.
    pub const PAIR_SETUP_TIMEOUT: Self = Duration::from_secs(20);

    /// Creates a [`Duration`] from a number of milliseconds.
    pub const fn from_millis(millis: u32) -> Self {
        Duration(millis)
    }

    /// Creates a [`Duration`] representing a number of seconds.
    pub const fn from_secs(secs: u16) -> Self {
        Duration(secs as u32 * 1_000)
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub fn whole_secs(&self) -> u32 {
        self.0 / 1_000
    }

    /// Returns the number of milliseconds represented by `self`.
    pub fn as_millis(&self) -> u32 {
        self.0
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.checked_add(rhs.0).expect("duration overflow"))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.checked_sub(rhs.0).expect("duration underflow"))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}s", self.0 / 1_000, self.0 % 1_000)
    }
}

/// A point in time, relative to an unspecified epoch.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    /// Creates an [`Instant`] from raw milliseconds since the clock's epoch.
    pub const fn from_raw_millis(millis: u64) -> Self {
        Instant(millis)
    }

    /// Returns the raw milliseconds since the clock's epoch.
    pub fn raw_millis(&self) -> u64 {
        self.0
    }

    /// Returns the duration that passed between `earlier` and `self`.
    ///
    /// Panics when `earlier` is a later instant than `self`.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        let millis = self.0.checked_sub(earlier.0).expect("wrong instant order");
        debug_assert!(millis <= u64::from(u32::max_value()));
        Duration::from_millis(millis as u32)
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0 + u64::from(d.as_millis()))
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_math() {
        let t0 = Instant::from_raw_millis(1_000);
        let t1 = t0 + Duration::from_millis(150);
        assert_eq!(t1.duration_since(t0), Duration::from_millis(150));
        assert!(t1 > t0);
    }

    #[test]
    #[should_panic]
    fn instant_order() {
        let t0 = Instant::from_raw_millis(1_000);
        let _ = t0.duration_since(t0 + Duration::from_millis(1));
    }
}
