//! Monotonic deadlines.

use std::fmt;
use std::time::Duration;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// A point on the coordinator's monotonic clock, as `(seconds, nanoseconds)`.
///
/// Ordering compares seconds first and uses nanoseconds to break ties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    secs: u64,
    nanos: u32,
}

impl Deadline {
    /// Creates a deadline, carrying excess nanoseconds into seconds.
    pub fn new(secs: u64, nanos: u32) -> Self {
        Self {
            secs: secs.saturating_add(u64::from(nanos / NANOS_PER_SEC)),
            nanos: nanos % NANOS_PER_SEC,
        }
    }

    pub fn from_duration(elapsed: Duration) -> Self {
        Self {
            secs: elapsed.as_secs(),
            nanos: elapsed.subsec_nanos(),
        }
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub fn nanos(&self) -> u32 {
        self.nanos
    }

    pub fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }

    /// Whether this deadline has passed at `now`.
    pub fn is_expired(&self, now: Deadline) -> bool {
        now >= *self
    }

    pub fn saturating_add(self, by: Duration) -> Self {
        Self::from_duration(self.as_duration().saturating_add(by))
    }

    /// Time elapsed from `earlier` to `self`, or zero.
    pub fn saturating_since(self, earlier: Deadline) -> Duration {
        self.as_duration().saturating_sub(earlier.as_duration())
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.secs, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_dominate() {
        assert!(Deadline::new(2, 0) > Deadline::new(1, 999_999_999));
        assert!(Deadline::new(1, 5) > Deadline::new(1, 4));
        assert_eq!(Deadline::new(1, 5), Deadline::new(1, 5));
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let deadline = Deadline::new(3, 500);
        assert!(!deadline.is_expired(Deadline::new(3, 499)));
        assert!(deadline.is_expired(Deadline::new(3, 500)));
        assert!(deadline.is_expired(Deadline::new(4, 0)));
    }

    #[test]
    fn test_normalizes_nanos() {
        let d = Deadline::new(1, 2_500_000_000);
        assert_eq!(d.secs(), 3);
        assert_eq!(d.nanos(), 500_000_000);
        assert_eq!(d.to_string(), "3.500000000s");
    }

    #[test]
    fn test_arithmetic() {
        let d = Deadline::new(1, 900_000_000).saturating_add(Duration::from_millis(200));
        assert_eq!(d, Deadline::new(2, 100_000_000));
        assert_eq!(
            d.saturating_since(Deadline::new(1, 0)),
            Duration::from_millis(1100)
        );
        assert_eq!(Deadline::new(0, 0).saturating_since(d), Duration::ZERO);
    }
}
