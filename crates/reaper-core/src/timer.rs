//! Min-heap of connection expiry deadlines.
//!
//! Every live connection owns one [`TimerEntry`]. Entries live in an arena of
//! slots addressed by generational [`TimerId`] handles, while the heap itself
//! is a dense array of `(expiry, slot)` nodes. Each stored entry records its
//! current array index so `adjust` and `remove` can reposition it directly
//! instead of searching.
//!
//! # Deletion
//!
//! Two ways to take an entry out of service:
//!
//! - [`TimerHeap::cancel`] is lazy: the eviction callback is dropped and the
//!   entry is tombstoned, but it stays in the array (and in [`TimerHeap::len`])
//!   until a sweep pops it. O(1), and it never touches heap topology.
//! - [`TimerHeap::remove`] is strict: swap with the last node, shrink, sift.
//!   O(log n). The dispatch loop uses this when it closes a connection itself,
//!   so tombstones only come from explicit cancellation and
//!   [`TimerHeap::purge_cancelled`] can reclaim them in bulk.
//!
//! # Handles
//!
//! A [`TimerId`] goes stale once its entry is popped or removed. Every
//! operation on a stale handle is a no-op that reports failure through its
//! return value; nothing panics.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Eviction action run when an entry expires.
///
/// Receives the entry's user data by value (typically the connection handle).
pub type EvictFn<D> = Box<dyn FnOnce(D) + Send>;

/// Stable handle to an entry in a [`TimerHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    slot: u32,
    generation: u32,
}

/// Thread-safe cancellation flag shared with a timer entry.
///
/// Cancelling through the token is the only timer mutation allowed off the
/// dispatch thread. It only flips a flag; the next sweep that pops the entry
/// skips its callback.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the live state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the entry as cancelled.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the entry has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One connection's eviction deadline.
pub struct TimerEntry<I, D> {
    expire: I,
    data: D,
    callback: Option<EvictFn<D>>,
    token: CancelToken,
    position: Option<usize>,
}

impl<I, D> TimerEntry<I, D> {
    /// Create an entry expiring at `expire` that calls `on_expire(data)`.
    pub fn new(expire: I, data: D, on_expire: impl FnOnce(D) + Send + 'static) -> Self {
        Self {
            expire,
            data,
            callback: Some(Box::new(on_expire)),
            token: CancelToken::new(),
            position: None,
        }
    }

    /// Absolute expiry instant.
    pub fn expire(&self) -> I
    where
        I: Copy,
    {
        self.expire
    }

    /// User data handed to the callback.
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Heap position. `None` once the entry is outside a heap.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Whether the callback has been dropped or the token cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.callback.is_none() || self.token.is_cancelled()
    }

    /// Token for cancelling this entry from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Run the eviction callback now.
    ///
    /// Returns `false` without calling anything if the entry was cancelled.
    pub fn fire(self) -> bool {
        match self.callback {
            Some(callback) if !self.token.is_cancelled() => {
                callback(self.data);
                true
            },
            _ => false,
        }
    }

    /// Consume the entry, returning its user data without running the callback.
    pub fn into_data(self) -> D {
        self.data
    }
}

impl<I: fmt::Debug, D: fmt::Debug> fmt::Debug for TimerEntry<I, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("expire", &self.expire)
            .field("data", &self.data)
            .field("cancelled", &self.is_cancelled())
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Counts from one [`TimerHeap::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries whose callback ran
    pub evicted: usize,
    /// Cancelled entries popped without running a callback
    pub discarded: usize,
}

impl SweepReport {
    /// Total entries physically removed.
    pub fn popped(&self) -> usize {
        self.evicted + self.discarded
    }
}

/// Array node: the ordering key lives here so comparisons never touch the arena.
#[derive(Debug, Clone, Copy)]
struct Node<I> {
    expire: I,
    slot: u32,
}

struct Stored<D> {
    data: D,
    callback: Option<EvictFn<D>>,
    token: CancelToken,
    position: usize,
}

impl<D> Stored<D> {
    fn is_cancelled(&self) -> bool {
        self.callback.is_none() || self.token.is_cancelled()
    }
}

struct Slot<D> {
    generation: u32,
    stored: Option<Stored<D>>,
}

/// Binary min-heap of expiry deadlines.
///
/// Ordered by expiry; ties are broken by nothing in particular. Owned by the
/// dispatch thread. Only [`CancelToken`] crosses threads.
pub struct TimerHeap<I, D> {
    heap: Vec<Node<I>>,
    slots: Vec<Slot<D>>,
    free: Vec<u32>,
}

impl<I, D> Default for TimerHeap<I, D> {
    fn default() -> Self {
        Self { heap: Vec::new(), slots: Vec::new(), free: Vec::new() }
    }
}

impl<I: Copy + Ord, D> TimerHeap<I, D> {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty heap with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    /// Number of entries physically in the heap, tombstones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the heap holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Earliest expiry, if any.
    pub fn peek_expiry(&self) -> Option<I> {
        self.heap.first().map(|node| node.expire)
    }

    /// Insert an entry. O(log n), always succeeds.
    pub fn add(&mut self, entry: TimerEntry<I, D>) -> TimerId {
        let TimerEntry { expire, data, callback, token, .. } = entry;
        let position = self.heap.len();
        let stored = Stored { data, callback, token, position };

        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot as usize].stored = Some(stored);
            slot
        } else {
            let slot = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, stored: Some(stored) });
            slot
        };

        let id = TimerId { slot, generation: self.slots[slot as usize].generation };
        self.heap.push(Node { expire, slot });
        self.sift_up(position);
        id
    }

    /// Move an entry's deadline and restore heap order.
    ///
    /// Sifts up when the new expiry is earlier than the parent's, down
    /// otherwise. Returns `false` for a stale handle.
    pub fn adjust(&mut self, id: TimerId, expire: I) -> bool {
        let Some(position) = self.locate(id) else {
            return false;
        };

        self.heap[position].expire = expire;
        self.restore(position);
        true
    }

    /// Lazily cancel an entry.
    ///
    /// Drops the callback and flips the cancel token. Heap structure and the
    /// entry's position are untouched; the entry stays counted in `len()`
    /// until a sweep pops it. Returns `false` for a stale handle.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(stored) = self.stored_mut(id) else {
            return false;
        };

        stored.callback = None;
        stored.token.cancel();
        true
    }

    /// Remove an entry immediately. O(log n).
    ///
    /// Returns the detached entry so the caller can [`TimerEntry::fire`] it or
    /// recover its data. `None` for a stale handle.
    pub fn remove(&mut self, id: TimerId) -> Option<TimerEntry<I, D>> {
        let position = self.locate(id)?;
        let node = self.remove_at(position)?;
        let stored = self.release(node.slot)?;

        Some(TimerEntry {
            expire: node.expire,
            data: stored.data,
            callback: stored.callback,
            token: stored.token,
            position: None,
        })
    }

    /// Pop every entry with `expire <= now`, evicting the live ones.
    ///
    /// Entries are processed in non-decreasing expiry order. Cancelled
    /// entries are popped without running a callback. Stops at the first
    /// entry still in the future.
    pub fn sweep(&mut self, now: I) -> SweepReport {
        let mut report = SweepReport::default();

        while let Some(top) = self.heap.first() {
            if top.expire > now {
                break;
            }

            let Some(node) = self.remove_at(0) else {
                break;
            };
            let Some(stored) = self.release(node.slot) else {
                continue;
            };

            match stored.callback {
                Some(callback) if !stored.token.is_cancelled() => {
                    callback(stored.data);
                    report.evicted += 1;
                },
                _ => report.discarded += 1,
            }
        }

        report
    }

    /// Physically drop every cancelled entry and rebuild the heap. O(n).
    ///
    /// Returns the number of entries reclaimed.
    pub fn purge_cancelled(&mut self) -> usize {
        let nodes = std::mem::take(&mut self.heap);
        let mut purged = 0;

        for node in nodes {
            let cancelled = self.slots[node.slot as usize]
                .stored
                .as_ref()
                .is_none_or(Stored::is_cancelled);

            if cancelled {
                self.release(node.slot);
                purged += 1;
            } else {
                self.heap.push(node);
            }
        }

        for position in 0..self.heap.len() {
            self.set_position(self.heap[position].slot, position);
        }
        for position in (0..self.heap.len() / 2).rev() {
            self.sift_down(position);
        }

        purged
    }

    /// Drop every entry without running callbacks.
    pub fn clear(&mut self) {
        while let Some(node) = self.heap.pop() {
            self.release(node.slot);
        }
    }

    /// Whether `id` still refers to an entry in the heap.
    pub fn contains(&self, id: TimerId) -> bool {
        self.locate(id).is_some()
    }

    /// Current expiry of `id`.
    pub fn expiry(&self, id: TimerId) -> Option<I> {
        self.locate(id).map(|position| self.heap[position].expire)
    }

    /// Current array index of `id`.
    pub fn position(&self, id: TimerId) -> Option<usize> {
        self.locate(id)
    }

    /// User data of `id`.
    pub fn data(&self, id: TimerId) -> Option<&D> {
        self.stored(id).map(|stored| &stored.data)
    }

    /// Whether `id` is tombstoned. `None` for a stale handle.
    pub fn is_cancelled(&self, id: TimerId) -> Option<bool> {
        self.stored(id).map(Stored::is_cancelled)
    }

    /// Cross-thread cancellation token of `id`.
    pub fn cancel_token(&self, id: TimerId) -> Option<CancelToken> {
        self.stored(id).map(|stored| stored.token.clone())
    }

    /// Number of tombstoned entries still in the heap. O(n).
    pub fn cancelled_count(&self) -> usize {
        self.heap
            .iter()
            .filter(|node| {
                self.slots[node.slot as usize].stored.as_ref().is_none_or(Stored::is_cancelled)
            })
            .count()
    }

    /// Entries in array order as `(handle, expiry, recorded position)`.
    ///
    /// The recorded position is what the entry believes its index is; for a
    /// consistent heap it equals the iteration index.
    pub fn iter(&self) -> impl Iterator<Item = (TimerId, I, usize)> + '_ {
        self.heap.iter().filter_map(|node| {
            let slot = &self.slots[node.slot as usize];
            let stored = slot.stored.as_ref()?;
            let id = TimerId { slot: node.slot, generation: slot.generation };
            Some((id, node.expire, stored.position))
        })
    }

    fn locate(&self, id: TimerId) -> Option<usize> {
        let position = self.stored(id)?.position;
        (position < self.heap.len() && self.heap[position].slot == id.slot).then_some(position)
    }

    fn stored(&self, id: TimerId) -> Option<&Stored<D>> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.stored.as_ref()
    }

    fn stored_mut(&mut self, id: TimerId) -> Option<&mut Stored<D>> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.stored.as_mut()
    }

    /// Take the entry out of its slot and retire the handle.
    fn release(&mut self, slot: u32) -> Option<Stored<D>> {
        let entry = &mut self.slots[slot as usize];
        let stored = entry.stored.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        stored
    }

    /// Detach the node at `position`, keeping the array dense and ordered.
    fn remove_at(&mut self, position: usize) -> Option<Node<I>> {
        let last = self.heap.len().checked_sub(1)?;
        if position != last {
            self.swap_nodes(position, last);
        }

        let node = self.heap.pop()?;
        if position < self.heap.len() {
            self.restore(position);
        }
        Some(node)
    }

    fn restore(&mut self, position: usize) {
        if position > 0 && self.heap[(position - 1) / 2].expire > self.heap[position].expire {
            self.sift_up(position);
        } else {
            self.sift_down(position);
        }
    }

    fn sift_up(&mut self, mut position: usize) {
        while position > 0 {
            let parent = (position - 1) / 2;
            if self.heap[parent].expire <= self.heap[position].expire {
                break;
            }
            self.swap_nodes(position, parent);
            position = parent;
        }
    }

    fn sift_down(&mut self, mut position: usize) {
        let len = self.heap.len();
        loop {
            let left = position * 2 + 1;
            if left >= len {
                break;
            }

            let right = left + 1;
            let child = if right < len && self.heap[right].expire < self.heap[left].expire {
                right
            } else {
                left
            };

            if self.heap[position].expire <= self.heap[child].expire {
                break;
            }
            self.swap_nodes(position, child);
            position = child;
        }
    }

    /// Swap two nodes and update both recorded positions together.
    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.set_position(self.heap[a].slot, a);
        self.set_position(self.heap[b].slot, b);
    }

    fn set_position(&mut self, slot: u32, position: usize) {
        if let Some(stored) = self.slots[slot as usize].stored.as_mut() {
            stored.position = position;
        }
    }
}

impl<I: fmt::Debug, D> fmt::Debug for TimerHeap<I, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHeap")
            .field("len", &self.heap.len())
            .field("next_expiry", &self.heap.first().map(|node| &node.expire))
            .field("free_slots", &self.free.len())
            .finish()
    }
}
