//! Structural heap invariants.

use std::{collections::HashSet, fmt::Debug};

use super::{HeapSnapshot, Invariant, InvariantResult, Violation};

/// Min-heap order: `expire(parent) <= expire(child)` for every node.
pub struct HeapOrder;

impl<I: Ord + Debug> Invariant<I> for HeapOrder {
    fn name(&self) -> &'static str {
        "heap_order"
    }

    fn check(&self, heap: &HeapSnapshot<I>) -> InvariantResult {
        for (index, entry) in heap.entries.iter().enumerate().skip(1) {
            let parent = &heap.entries[(index - 1) / 2];
            if parent.expire > entry.expire {
                return Err(Violation {
                    invariant: Invariant::<I>::name(self),
                    message: format!(
                        "child {index} expires at {:?} before its parent {:?}",
                        entry.expire, parent.expire
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Every entry's recorded position equals its actual array index.
pub struct PositionsMatchIndices;

impl<I> Invariant<I> for PositionsMatchIndices {
    fn name(&self) -> &'static str {
        "positions_match_indices"
    }

    fn check(&self, heap: &HeapSnapshot<I>) -> InvariantResult {
        for (index, entry) in heap.entries.iter().enumerate() {
            if entry.recorded_position != index {
                return Err(Violation {
                    invariant: Invariant::<I>::name(self),
                    message: format!(
                        "entry {:?} at index {index} records position {}",
                        entry.id, entry.recorded_position
                    ),
                });
            }
        }
        Ok(())
    }
}

/// `len()` counts exactly the entries in the array, tombstones included.
pub struct LenMatchesEntries;

impl<I> Invariant<I> for LenMatchesEntries {
    fn name(&self) -> &'static str {
        "len_matches_entries"
    }

    fn check(&self, heap: &HeapSnapshot<I>) -> InvariantResult {
        if heap.len == heap.entries.len() {
            Ok(())
        } else {
            Err(Violation {
                invariant: Invariant::<I>::name(self),
                message: format!("len() = {} but {} entries stored", heap.len, heap.entries.len()),
            })
        }
    }
}

/// No handle refers to two array nodes.
pub struct UniqueHandles;

impl<I> Invariant<I> for UniqueHandles {
    fn name(&self) -> &'static str {
        "unique_handles"
    }

    fn check(&self, heap: &HeapSnapshot<I>) -> InvariantResult {
        let mut seen = HashSet::with_capacity(heap.entries.len());
        for entry in &heap.entries {
            if !seen.insert(entry.id) {
                return Err(Violation {
                    invariant: Invariant::<I>::name(self),
                    message: format!("handle {:?} stored twice", entry.id),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use reaper_core::{TimerEntry, TimerHeap};

    use super::*;
    use crate::invariants::{EntrySnapshot, InvariantRegistry};

    #[test]
    fn consistent_heap_passes() {
        let mut heap = TimerHeap::new();
        for expire in [5u64, 3, 9, 1, 7] {
            heap.add(TimerEntry::new(expire, (), |()| {}));
        }

        let registry = InvariantRegistry::standard();
        assert!(registry.check_all(&HeapSnapshot::from_heap(&heap)).is_ok());
    }

    #[test]
    fn tampered_snapshot_is_caught() {
        let mut heap = TimerHeap::new();
        heap.add(TimerEntry::new(1u64, (), |()| {}));
        heap.add(TimerEntry::new(2u64, (), |()| {}));

        let mut snapshot = HeapSnapshot::from_heap(&heap);
        snapshot.entries.swap(0, 1);

        let violations = InvariantRegistry::standard().check_all(&snapshot).unwrap_err();
        let names: Vec<_> = violations.iter().map(|v| v.invariant).collect();
        assert!(names.contains(&"heap_order"));
        assert!(names.contains(&"positions_match_indices"));
    }

    #[test]
    fn len_mismatch_is_caught() {
        let snapshot = HeapSnapshot::<u64> { entries: Vec::<EntrySnapshot<u64>>::new(), len: 1 };
        assert!(LenMatchesEntries.check(&snapshot).is_err());
    }
}
