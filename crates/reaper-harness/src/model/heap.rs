//! Model and real heap drivers.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use reaper_core::{TimerEntry, TimerHeap, TimerId};

use super::{HeapOp, OpResult};

#[derive(Debug, Clone, Copy)]
struct ModelEntry {
    expire: u64,
    cancelled: bool,
}

/// Reference model: live entries keyed by tag.
#[derive(Debug, Default)]
pub struct ModelHeap {
    now: u64,
    next_tag: u32,
    live: BTreeMap<u32, ModelEntry>,
}

impl ModelHeap {
    /// Empty model at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries still stored, tombstones included.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Apply one operation.
    pub fn apply(&mut self, op: &HeapOp) -> OpResult {
        match *op {
            HeapOp::Add { delay } => {
                let tag = self.next_tag;
                self.next_tag += 1;
                let expire = self.now + u64::from(delay);
                self.live.insert(tag, ModelEntry { expire, cancelled: false });
                OpResult::Added(tag)
            },
            HeapOp::Adjust { target, delay } => {
                let Some(tag) = self.target(target) else {
                    return OpResult::Skipped;
                };
                let expire = self.now + u64::from(delay);
                match self.live.get_mut(&tag) {
                    Some(entry) => {
                        entry.expire = expire;
                        OpResult::Adjusted(true)
                    },
                    None => OpResult::Adjusted(false),
                }
            },
            HeapOp::Cancel { target } => {
                let Some(tag) = self.target(target) else {
                    return OpResult::Skipped;
                };
                match self.live.get_mut(&tag) {
                    Some(entry) => {
                        entry.cancelled = true;
                        OpResult::Cancelled(true)
                    },
                    None => OpResult::Cancelled(false),
                }
            },
            HeapOp::Remove { target } => match self.target(target) {
                Some(tag) => {
                    OpResult::Removed(self.live.remove(&tag).map(|entry| (tag, entry.expire)))
                },
                None => OpResult::Skipped,
            },
            HeapOp::Sweep { advance } => {
                self.now += u64::from(advance);
                let now = self.now;

                let due: Vec<_> = self
                    .live
                    .iter()
                    .filter(|(_, entry)| entry.expire <= now)
                    .map(|(tag, entry)| (*tag, *entry))
                    .collect();

                let mut evicted = Vec::new();
                let mut discarded = 0;
                for (tag, entry) in due {
                    self.live.remove(&tag);
                    if entry.cancelled {
                        discarded += 1;
                    } else {
                        evicted.push((entry.expire, tag));
                    }
                }
                evicted.sort_unstable();
                OpResult::Swept { evicted, discarded }
            },
            HeapOp::Purge => {
                let before = self.live.len();
                self.live.retain(|_, entry| !entry.cancelled);
                OpResult::Purged(before - self.live.len())
            },
        }
    }

    fn target(&self, target: u8) -> Option<u32> {
        (self.next_tag > 0).then(|| u32::from(target) % self.next_tag)
    }
}

/// Real [`TimerHeap`] driven by the same operations as [`ModelHeap`].
pub struct RealHeap {
    now: u64,
    heap: TimerHeap<u64, u32>,
    handles: Vec<TimerId>,
    fired: Arc<Mutex<Vec<u32>>>,
}

impl Default for RealHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl RealHeap {
    /// Empty heap at time zero.
    pub fn new() -> Self {
        Self {
            now: 0,
            heap: TimerHeap::new(),
            handles: Vec::new(),
            fired: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The wrapped heap.
    pub fn heap(&self) -> &TimerHeap<u64, u32> {
        &self.heap
    }

    /// Apply one operation.
    pub fn apply(&mut self, op: &HeapOp) -> OpResult {
        match *op {
            HeapOp::Add { delay } => {
                let tag = self.handles.len() as u32;
                let expire = self.now + u64::from(delay);
                let fired = Arc::clone(&self.fired);
                let id = self.heap.add(TimerEntry::new(expire, tag, move |tag| {
                    fired.lock().unwrap_or_else(PoisonError::into_inner).push(tag);
                }));
                self.handles.push(id);
                OpResult::Added(tag)
            },
            HeapOp::Adjust { target, delay } => match self.target(target) {
                Some(id) => OpResult::Adjusted(self.heap.adjust(id, self.now + u64::from(delay))),
                None => OpResult::Skipped,
            },
            HeapOp::Cancel { target } => match self.target(target) {
                Some(id) => OpResult::Cancelled(self.heap.cancel(id)),
                None => OpResult::Skipped,
            },
            HeapOp::Remove { target } => match self.target(target) {
                Some(id) => OpResult::Removed(
                    self.heap.remove(id).map(|entry| (*entry.data(), entry.expire())),
                ),
                None => OpResult::Skipped,
            },
            HeapOp::Sweep { advance } => {
                self.now += u64::from(advance);

                // Callbacks only see the tag; expiries may have been adjusted since add.
                let expiries: HashMap<u32, u64> = self
                    .heap
                    .iter()
                    .filter_map(|(id, expire, _)| Some((*self.heap.data(id)?, expire)))
                    .collect();

                let report = self.heap.sweep(self.now);
                let fired = std::mem::take(
                    &mut *self.fired.lock().unwrap_or_else(PoisonError::into_inner),
                );
                debug_assert_eq!(fired.len(), report.evicted);

                let evicted = fired
                    .into_iter()
                    .map(|tag| (expiries.get(&tag).copied().unwrap_or_default(), tag))
                    .collect();
                OpResult::Swept { evicted, discarded: report.discarded }
            },
            HeapOp::Purge => OpResult::Purged(self.heap.purge_cancelled()),
        }
    }

    fn target(&self, target: u8) -> Option<TimerId> {
        if self.handles.is_empty() {
            return None;
        }
        Some(self.handles[usize::from(target) % self.handles.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_and_real_agree_on_simple_script() {
        let ops = [
            HeapOp::Add { delay: 3 },
            HeapOp::Add { delay: 1 },
            HeapOp::Add { delay: 2 },
            HeapOp::Cancel { target: 2 },
            HeapOp::Sweep { advance: 2 },
            HeapOp::Adjust { target: 0, delay: 10 },
            HeapOp::Sweep { advance: 5 },
            HeapOp::Remove { target: 0 },
        ];

        let mut model = ModelHeap::new();
        let mut real = RealHeap::new();
        for op in &ops {
            let real_result = real.apply(op);
            assert!(real_result.is_ordered());
            assert_eq!(real_result.normalized(), model.apply(op).normalized(), "{op:?}");
        }
        assert_eq!(real.heap().len(), model.len());
        assert!(model.is_empty());
    }
}
