//! Observable heap state.

use reaper_core::{TimerHeap, TimerId};

/// One entry as seen from outside the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot<I> {
    /// Entry handle.
    pub id: TimerId,
    /// Expiry instant.
    pub expire: I,
    /// Position the entry believes it occupies.
    pub recorded_position: usize,
}

/// Array-order view of a heap.
#[derive(Debug, Clone)]
pub struct HeapSnapshot<I> {
    /// Entries in array order.
    pub entries: Vec<EntrySnapshot<I>>,
    /// Value reported by `TimerHeap::len`.
    pub len: usize,
}

impl<I: Copy + Ord> HeapSnapshot<I> {
    /// Capture `heap` as it is now.
    pub fn from_heap<D>(heap: &TimerHeap<I, D>) -> Self {
        let entries = heap
            .iter()
            .map(|(id, expire, recorded_position)| EntrySnapshot { id, expire, recorded_position })
            .collect();
        Self { entries, len: heap.len() }
    }
}
