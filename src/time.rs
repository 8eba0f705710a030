// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The monotonic clock abstraction used by delayed-task scheduling.
//!
//! [`Instant`] is opaque and only useful in combination with [`Duration`]; it
//! is produced by a [`Clock`]. The default [`SystemClock`] wraps
//! [`std::time::Instant`]; tests substitute a [`FakeClock`] to exercise timer
//! behavior deterministically.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::Mutex;
use std::time::Duration;

/// A measurement of a monotonically nondecreasing clock.
///
/// Opaque and useful only in combination with [`Duration`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(std::time::Instant);

impl Instant {
    /// Returns the amount of time elapsed from `earlier` to `self`, saturating
    /// to zero if `earlier` is later than `self`.
    #[must_use]
    pub fn duration_since(self, earlier: Self) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    /// Returns `Some(t)` where `t` is `self + duration`, or `None` on overflow.
    #[must_use]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        self.0.checked_add(duration).map(Self)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// # Panics
    ///
    /// Panics if the resulting point in time cannot be represented. See
    /// [`Instant::checked_add`] for a non-panicking version.
    fn add(self, other: Duration) -> Instant {
        self.checked_add(other)
            .expect("overflow when adding duration to instant")
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, other: Duration) {
        *self = *self + other;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, other: Duration) -> Instant {
        Self(self.0 - other)
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, other: Duration) {
        *self = *self - other;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    /// Returns the amount of time elapsed from `other` to `self`, saturating
    /// to zero if `other` is later than `self`.
    fn sub(self, other: Instant) -> Duration {
        self.duration_since(other)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A monotonic time source.
///
/// The runtime never reads wall-clock time directly, only through this
/// trait, so tests can substitute a [`FakeClock`] that advances under
/// explicit control.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// The default [`Clock`], backed by [`std::time::Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant(std::time::Instant::now())
    }
}

/// A [`Clock`] whose value is advanced explicitly, for deterministic tests of
/// timer behavior without sleeping real wall-clock time.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<Instant>,
}

impl FakeClock {
    /// Constructs a `FakeClock` starting at the real current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant(std::time::Instant::now())),
        }
    }

    /// Advances the clock by `duration`.
    #[expect(clippy::missing_panics_doc, reason = "internal mutex poisoning only")]
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(50));
        let t1 = clock.now();
        assert!(t1 > t0);
        assert_eq!(t1.duration_since(t0), Duration::from_millis(50));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock;
        let t0 = clock.now();
        let t1 = clock.now();
        assert!(t1 >= t0);
    }
}
