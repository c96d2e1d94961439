//! Work items dispatched to the worker pool.
//!
//! A work item is a connection's request object as seen by the pool: it can
//! attempt one non-blocking read or write and run business logic against a
//! backend connection. The pool never owns the item's lifetime; it records the
//! outcome in [`WorkFlags`] and the dispatch thread acts on it.
//!
//! # Flag protocol
//!
//! ```text
//!   worker                               dispatch thread
//!   ──────                               ───────────────
//!   success ─> needs_followup = 1  ───>  take_outcome() = Processed ─> refresh timer
//!   failure ─> needs_timer_action = 1
//!              needs_followup = 1  ───>  take_outcome() = Failed    ─> evict
//! ```
//!
//! `needs_followup` is written last with release ordering so the dispatch
//! thread never observes it before the timer-action bit.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Which I/O step a reactor-mode worker performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchState {
    /// Read from the peer, then run business logic
    #[default]
    Read,
    /// Flush pending output to the peer
    Write,
}

impl DispatchState {
    fn to_bits(self) -> u8 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }

    fn from_bits(bits: u8) -> Self {
        if bits == 0 { Self::Read } else { Self::Write }
    }
}

/// Result of one trip through the pool, as seen by the dispatch thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// I/O and business logic succeeded; refresh the connection's timer
    Processed,
    /// I/O failed; the connection must be evicted
    Failed,
}

/// Completion flags shared between a worker and the dispatch thread.
#[derive(Debug, Default)]
pub struct WorkFlags {
    state: AtomicU8,
    needs_followup: AtomicBool,
    needs_timer_action: AtomicBool,
}

impl WorkFlags {
    /// Fresh flags in the read state.
    pub fn new() -> Self {
        Self::default()
    }

    /// I/O step for the next reactor dispatch.
    pub fn dispatch_state(&self) -> DispatchState {
        DispatchState::from_bits(self.state.load(Ordering::Acquire))
    }

    /// Stamp the I/O step before a reactor submission.
    pub fn set_dispatch_state(&self, state: DispatchState) {
        self.state.store(state.to_bits(), Ordering::Release);
    }

    /// Record success.
    pub fn mark_processed(&self) {
        self.needs_followup.store(true, Ordering::Release);
    }

    /// Record failure: the dispatch thread must evict the connection.
    pub fn mark_failed(&self) {
        self.needs_timer_action.store(true, Ordering::Release);
        self.needs_followup.store(true, Ordering::Release);
    }

    /// Worker finished and the dispatch thread has not looked yet.
    pub fn needs_followup(&self) -> bool {
        self.needs_followup.load(Ordering::Acquire)
    }

    /// Worker asked for a timer refresh or eviction.
    pub fn needs_timer_action(&self) -> bool {
        self.needs_timer_action.load(Ordering::Acquire)
    }

    /// Consume the worker's report. `None` if there is nothing to act on.
    pub fn take_outcome(&self) -> Option<Outcome> {
        if !self.needs_followup.swap(false, Ordering::AcqRel) {
            return None;
        }

        if self.needs_timer_action.swap(false, Ordering::AcqRel) {
            Some(Outcome::Failed)
        } else {
            Some(Outcome::Processed)
        }
    }

    /// Clear both completion bits.
    pub fn reset(&self) {
        self.needs_timer_action.store(false, Ordering::Release);
        self.needs_followup.store(false, Ordering::Release);
    }
}

/// Capability interface the worker pool requires from a request object.
///
/// Methods take `&self`: the item is shared between the dispatch thread and
/// one worker through an `Arc`, so implementations keep their mutable state
/// behind their own locks. The pool guarantees a single worker at a time.
pub trait WorkItem: Send + Sync + 'static {
    /// Backend connection type handed to business logic.
    type Backend: Send + 'static;

    /// Completion flags for this item.
    fn flags(&self) -> &WorkFlags;

    /// Read whatever the peer has sent. `false` on error or peer close.
    fn attempt_read(&self) -> bool;

    /// Write pending output. `false` on error.
    fn attempt_write(&self) -> bool;

    /// Application step, run with a backend connection held for its duration.
    fn run_business_logic(&self, backend: &mut Self::Backend);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reports_processed_once() {
        let flags = WorkFlags::new();
        assert_eq!(flags.take_outcome(), None);

        flags.mark_processed();
        assert!(flags.needs_followup());
        assert!(!flags.needs_timer_action());

        assert_eq!(flags.take_outcome(), Some(Outcome::Processed));
        assert_eq!(flags.take_outcome(), None);
    }

    #[test]
    fn failure_reports_failed_and_clears() {
        let flags = WorkFlags::new();
        flags.mark_failed();
        assert!(flags.needs_followup());
        assert!(flags.needs_timer_action());

        assert_eq!(flags.take_outcome(), Some(Outcome::Failed));
        assert!(!flags.needs_timer_action());
    }

    #[test]
    fn dispatch_state_round_trips() {
        let flags = WorkFlags::new();
        assert_eq!(flags.dispatch_state(), DispatchState::Read);
        flags.set_dispatch_state(DispatchState::Write);
        assert_eq!(flags.dispatch_state(), DispatchState::Write);
    }

    #[test]
    fn reset_clears_pending_report() {
        let flags = WorkFlags::new();
        flags.mark_failed();
        flags.reset();
        assert_eq!(flags.take_outcome(), None);
    }
}
