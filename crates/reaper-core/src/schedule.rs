//! Fixed-interval sweep trigger.
//!
//! Replaces a repeating process alarm: the dispatch loop asks how long it may
//! block before the next sweep is due, uses that as its poll timeout, and
//! rearms once the sweep has run.

use std::{
    ops::{Add, Sub},
    time::Duration,
};

/// Deadline of the next periodic sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepSchedule<I> {
    interval: Duration,
    next: I,
}

impl<I> SweepSchedule<I>
where
    I: Copy + Ord + Add<Duration, Output = I> + Sub<Output = Duration>,
{
    /// First sweep fires one `interval` after `now`.
    pub fn new(interval: Duration, now: I) -> Self {
        Self { interval, next: now + interval }
    }

    /// Configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Instant at which the next sweep is due.
    pub fn next_due(&self) -> I {
        self.next
    }

    /// Whether the sweep is due at `now`.
    pub fn is_due(&self, now: I) -> bool {
        now >= self.next
    }

    /// Time left until the sweep is due, zero if already due.
    pub fn remaining(&self, now: I) -> Duration {
        if now >= self.next { Duration::ZERO } else { self.next - now }
    }

    /// Schedule the next sweep one interval after `now`.
    pub fn rearm(&mut self, now: I) {
        self.next = now + self.interval;
    }

    /// Make the sweep due immediately (e.g. on an external alarm signal).
    pub fn expire_now(&mut self, now: I) {
        self.next = now;
    }
}
