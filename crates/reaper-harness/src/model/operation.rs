//! Operations and results for model-based timer testing.

use arbitrary::Arbitrary;

/// One step applied to both the model and the real heap.
///
/// Targets are indices into the list of every entry ever added, taken modulo
/// its length, so operations on already evicted entries are exercised too.
#[derive(Debug, Clone, Arbitrary)]
pub enum HeapOp {
    /// Add an entry expiring `delay` ticks after the current time.
    Add {
        /// Ticks until expiry.
        delay: u8,
    },

    /// Move an entry's expiry to `delay` ticks after the current time.
    Adjust {
        /// Entry to adjust.
        target: u8,
        /// New delay.
        delay: u8,
    },

    /// Lazily cancel an entry.
    Cancel {
        /// Entry to cancel.
        target: u8,
    },

    /// Remove an entry immediately.
    Remove {
        /// Entry to remove.
        target: u8,
    },

    /// Advance the clock and sweep.
    Sweep {
        /// Ticks to advance before sweeping.
        advance: u8,
    },

    /// Drop every cancelled entry.
    Purge,
}

/// Observable result of a [`HeapOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// Entry added with the given tag.
    Added(u32),
    /// Whether the handle was live.
    Adjusted(bool),
    /// Whether the handle was live.
    Cancelled(bool),
    /// Tag and expiry of the removed entry.
    Removed(Option<(u32, u64)>),
    /// Entries evicted (in callback order) and tombstones discarded.
    Swept {
        /// `(expire, tag)` in the order callbacks ran.
        evicted: Vec<(u64, u32)>,
        /// Cancelled entries popped without a callback.
        discarded: usize,
    },
    /// Entries reclaimed by a purge.
    Purged(usize),
    /// Operation targeted an empty handle list.
    Skipped,
}

impl OpResult {
    /// Form that is comparable across implementations.
    ///
    /// Sweep order among equal expiries is unspecified, so evictions are
    /// sorted.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Swept { mut evicted, discarded } => {
                evicted.sort_unstable();
                Self::Swept { evicted, discarded }
            },
            other => other,
        }
    }

    /// Whether a sweep's callbacks ran in non-decreasing expiry order.
    pub fn is_ordered(&self) -> bool {
        match self {
            Self::Swept { evicted, .. } => evicted.windows(2).all(|w| w[0].0 <= w[1].0),
            _ => true,
        }
    }
}
