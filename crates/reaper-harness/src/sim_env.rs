//! Manually advanced clock.
//!
//! `SimEnv` hands out real `std::time::Instant` values so it plugs into the
//! same code paths as production, but time only moves when a test calls
//! [`SimEnv::advance`]. Clones share the clock.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use reaper_core::Environment;

/// Simulated environment with a shared virtual clock.
#[derive(Clone, Debug)]
pub struct SimEnv {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Clock starting at the current instant, frozen until advanced.
    #[allow(clippy::disallowed_methods)]
    pub fn new() -> Self {
        Self { base: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Move the clock forward for every clone.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }

    /// Time elapsed since the environment was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Environment for SimEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_frozen_until_advanced() {
        let env = SimEnv::new();
        let t1 = env.now();
        assert_eq!(env.now(), t1);

        env.clone().advance(Duration::from_secs(3));
        assert_eq!(env.now() - t1, Duration::from_secs(3));
        assert_eq!(env.deadline_after(Duration::from_secs(2)) - t1, Duration::from_secs(5));
    }
}
