//! Recording timestamps.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// A point on a recording's timeline, with nanosecond resolution.
///
/// Ordering is derived from `(sec, nsec)`, so two times compare the way the
/// recording orders them. `nsec` is always kept below one second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
    pub sec: i64,
    pub nsec: u32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };

    /// Sorts after every real timestamp. Used as the sort key for stream
    /// items that carry no timestamp of their own.
    pub const MAX: Time = Time { sec: i64::MAX, nsec: (NSEC_PER_SEC - 1) as u32 };

    pub fn new(sec: i64, nsec: u32) -> Self {
        let extra = nsec as u64 / NSEC_PER_SEC;
        Self { sec: sec.saturating_add(extra as i64), nsec: (nsec as u64 % NSEC_PER_SEC) as u32 }
    }

    pub fn from_secs(sec: i64) -> Self {
        Self { sec, nsec: 0 }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_nanos(millis.saturating_mul(1_000_000))
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self {
            sec: nanos.div_euclid(NSEC_PER_SEC as i64),
            nsec: nanos.rem_euclid(NSEC_PER_SEC as i64) as u32,
        }
    }

    /// Total nanoseconds since the epoch of the timeline.
    pub fn as_nanos(&self) -> i128 {
        self.sec as i128 * NSEC_PER_SEC as i128 + self.nsec as i128
    }

    /// Nanoseconds elapsed since `earlier`, saturating to zero when `self`
    /// precedes it.
    pub fn nanos_since(&self, earlier: Time) -> u64 {
        let diff = self.as_nanos() - earlier.as_nanos();
        if diff < 0 { 0 } else { diff.min(u64::MAX as i128) as u64 }
    }

    pub fn add_nanos(&self, nanos: u64) -> Time {
        let total = self.nsec as u64 + nanos;
        Time {
            sec: self.sec.saturating_add((total / NSEC_PER_SEC) as i64),
            nsec: (total % NSEC_PER_SEC) as u32,
        }
    }

    pub fn add_duration(&self, duration: Duration) -> Time {
        self.add_nanos(duration.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn clamp_to(self, min: Time, max: Time) -> Time {
        if self < min {
            min
        } else if self > max {
            max
        } else {
            self
        }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_sec_then_nsec() {
        assert!(Time::new(1, 0) < Time::new(2, 0));
        assert!(Time::new(1, 5) < Time::new(1, 6));
        assert!(Time::new(1, 999_999_999) < Time::new(2, 0));
        assert!(Time::MAX > Time::new(i64::MAX, 0));
    }

    #[test]
    fn new_normalizes_overflowing_nanos() {
        let t = Time::new(1, 1_500_000_000);
        assert_eq!(t, Time { sec: 2, nsec: 500_000_000 });
    }

    #[test]
    fn add_nanos_carries_into_seconds() {
        let t = Time::new(1, 999_999_999).add_nanos(2);
        assert_eq!(t, Time { sec: 2, nsec: 1 });
    }

    #[test]
    fn nanos_since_saturates() {
        let early = Time::from_secs(1);
        let late = Time::from_secs(3);
        assert_eq!(late.nanos_since(early), 2 * NSEC_PER_SEC);
        assert_eq!(early.nanos_since(late), 0);
    }

    #[test]
    fn clamp_stays_in_bounds() {
        let lo = Time::from_secs(1);
        let hi = Time::from_secs(5);
        assert_eq!(Time::from_secs(0).clamp_to(lo, hi), lo);
        assert_eq!(Time::from_secs(9).clamp_to(lo, hi), hi);
        assert_eq!(Time::from_secs(3).clamp_to(lo, hi), Time::from_secs(3));
    }

    #[test]
    fn from_millis_matches_nanos() {
        assert_eq!(Time::from_millis(1_500), Time { sec: 1, nsec: 500_000_000 });
    }
}
