// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time.
//!
//! The kernel clock is a monotonic tick counter advanced once per
//! scheduler loop iteration; one tick stands in for one millisecond.
//! Deadlines are absolute timestamps.

/// In-kernel timestamp in ticks since boot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn advance(&mut self, ticks: u64) {
        self.0 += ticks;
    }

    /// Deadline `ms` milliseconds after this instant.
    pub fn after_millis(self, ms: u64) -> Self {
        Self(self.0 + ms)
    }

    /// Whole seconds since boot.
    pub fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    /// Nanoseconds of the current partial second.
    pub fn subsec_nanos(self) -> u32 {
        ((self.0 % 1000) * 1_000_000) as u32
    }
}

impl From<u64> for Timestamp {
    fn from(t: u64) -> Self {
        Self(t)
    }
}

impl From<Timestamp> for u64 {
    fn from(t: Timestamp) -> Self {
        t.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_compare_as_expected() {
        let mut now = Timestamp::ZERO;
        let deadline = now.after_millis(5);
        assert!(now < deadline);
        now.advance(5);
        assert!(now >= deadline);
    }

    #[test]
    fn timespec_parts_track_ticks() {
        let mut t = Timestamp::ZERO;
        t.advance(2750);
        assert_eq!(t.as_secs(), 2);
        assert_eq!(t.subsec_nanos(), 750_000_000);
    }
}
