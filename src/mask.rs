// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed execution queue labels and the thread-affinity bitset over them.

use std::fmt;

/// A typed label identifying one execution queue.
///
/// Marks are small integer tags with a total order; two well-known marks are
/// provided (`MAIN`, `WORKER`) but an [`ExecutionSystem`](crate::executor::ExecutionSystem)
/// may be configured with any number of marks up to `max_queue`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueMark(u8);

impl QueueMark {
    /// The queue serviced by the thread that owns the [`ExecutionSystem`].
    pub const MAIN: Self = Self(0);
    /// The default queue for background worker threads.
    pub const WORKER: Self = Self(1);

    /// The largest queue tag a [`ThreadMask`] can represent.
    pub const MAX: u8 = 63;

    /// Constructs a `QueueMark` from a raw tag.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is greater than [`QueueMark::MAX`].
    #[must_use]
    pub const fn new(tag: u8) -> Self {
        assert!(tag <= Self::MAX, "queue mark out of range");
        Self(tag)
    }

    /// Returns the raw tag of this mark.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for QueueMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MAIN => write!(f, "QueueMark::MAIN"),
            Self::WORKER => write!(f, "QueueMark::WORKER"),
            Self(tag) => write!(f, "QueueMark({tag})"),
        }
    }
}

/// Which queues a thread may drain.
///
/// A thread services exactly those queue tags whose bit is set; the bitset is
/// immutable once a [`WorkerConfig`](crate::executor::WorkerConfig) is built.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct ThreadMask(u64);

impl ThreadMask {
    /// A mask that permits no queues.
    pub const NONE: Self = Self(0);

    /// Returns a mask that permits only `mark`.
    #[must_use]
    pub const fn only(mark: QueueMark) -> Self {
        Self(1 << mark.tag())
    }

    /// Returns a mask that permits `mark` in addition to the current set.
    #[must_use]
    pub const fn with(self, mark: QueueMark) -> Self {
        Self(self.0 | (1 << mark.tag()))
    }

    /// Returns the union of two masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the intersection of two masks.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Returns `true` if `mark` is permitted by this mask.
    #[must_use]
    pub const fn contains(self, mark: QueueMark) -> bool {
        self.0 & (1 << mark.tag()) != 0
    }

    /// Returns `true` if no queues are permitted by this mask.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the marks permitted by this mask, in ascending order.
    pub fn iter(self) -> impl Iterator<Item = QueueMark> {
        let bits = self.0;
        (0..=QueueMark::MAX).filter_map(move |tag| {
            if bits & (1 << tag) != 0 {
                Some(QueueMark::new(tag))
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for ThreadMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl core::ops::BitOr for ThreadMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl core::ops::BitAnd for ThreadMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_membership() {
        let mask = ThreadMask::only(QueueMark::MAIN).with(QueueMark::WORKER);
        assert!(mask.contains(QueueMark::MAIN));
        assert!(mask.contains(QueueMark::WORKER));
        assert!(!mask.contains(QueueMark::new(5)));
    }

    #[test]
    fn mask_union_intersection() {
        let a = ThreadMask::only(QueueMark::MAIN);
        let b = ThreadMask::only(QueueMark::WORKER);
        assert_eq!((a | b).iter().count(), 2);
        assert_eq!((a & b), ThreadMask::NONE);
    }

    #[test]
    fn ordering_is_total() {
        assert!(QueueMark::MAIN < QueueMark::WORKER);
    }
}
