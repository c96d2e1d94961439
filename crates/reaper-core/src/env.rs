//! Environment abstraction for deterministic testing.
//!
//! Decouples deadline logic from the system clock. Production code uses the
//! real monotonic clock, simulation tests advance a virtual clock by hand so
//! that sweeps and refreshes are reproducible.

use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

/// Abstract environment providing time.
///
/// # Invariants
///
/// Implementations MUST guarantee that `now()` never goes backwards.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; simulation
    /// environments hand out instants from a manually advanced clock.
    type Instant: Copy
        + Ord
        + Debug
        + Send
        + Sync
        + Add<Duration, Output = Self::Instant>
        + Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// Subsequent calls must return times >= previous calls.
    fn now(&self) -> Self::Instant;

    /// Deadline `timeout` from now.
    ///
    /// Convenience for arming or refreshing a connection timer.
    fn deadline_after(&self, timeout: Duration) -> Self::Instant {
        self.now() + timeout
    }
}
