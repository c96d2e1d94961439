//! Reference model of the timer heap.
//!
//! [`ModelHeap`] is a deliberately naive map of live entries. [`RealHeap`]
//! wraps a real [`TimerHeap`](reaper_core::TimerHeap) behind the same
//! interface. Both consume [`HeapOp`]s and produce [`OpResult`]s that a test
//! compares after every step.
//!
//! ```text
//! proptest / libfuzzer generates: Vec<HeapOp>
//!                    │
//!          ┌─────────┴─────────┐
//!          ▼                   ▼
//!      ModelHeap           RealHeap
//!      (BTreeMap)          (TimerHeap<u64, u32>)
//!          └──── OpResult ─────┘
//! ```

mod heap;
mod operation;

pub use heap::{ModelHeap, RealHeap};
pub use operation::{HeapOp, OpResult};
