use std::ops::{Add, AddAssign, Sub};

use crate::{Duration, Nanos};

/// A monotonic point in time, stored as nanoseconds since an arbitrary
/// process-local epoch (backed by `std::time::Instant`).
#[derive(Copy, Clone, Debug, Hash, PartialEq)]
#[repr(C)]
pub struct Instant(pub u64);

static PROCESS_EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

impl Default for Instant {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Instant {
    pub const MAX: Self = Self(u64::MAX);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn now() -> Self {
        let epoch = PROCESS_EPOCH.get_or_init(std::time::Instant::now);
        Instant(epoch.elapsed().as_nanos() as u64)
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_sub(*self)
    }

    #[inline]
    pub fn elapsed_since(&self, since: Instant) -> Duration {
        self.saturating_sub(since)
    }

    #[inline]
    pub fn saturating_sub(&self, other: Instant) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }
}

impl Eq for Instant {}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sub for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Add<Nanos> for Instant {
    type Output = Instant;
    fn add(self, rhs: Nanos) -> Self::Output {
        Instant(self.0 + rhs.0)
    }
}

impl Sub<Nanos> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Nanos) -> Self::Output {
        Instant(self.0.saturating_sub(rhs.0))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_elapsed_is_zero() {
        assert_eq!(Instant::ZERO.elapsed().0 > 0, true);
    }

    #[test]
    fn ordering_matches_arrival() {
        let a = Instant::now();
        std::thread::sleep(std::time::Duration::from_micros(10));
        let b = Instant::now();
        assert!(b > a);
    }
}
