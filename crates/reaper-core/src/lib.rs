//! Concurrency core of the reaper connection server.
//!
//! This crate holds the pieces that decide *when* an idle connection is closed
//! and *how* ready connections are turned into work off the event-loop thread.
//! It performs no socket I/O itself; the server crate wires it to `mio`.
//!
//! # Components
//!
//! - [`TimerHeap`]: min-heap of connection deadlines with O(log n)
//!   add/adjust/remove, lazy cancel, and batched [`TimerHeap::sweep`]
//! - [`ThreadPool`]: fixed workers consuming a bounded FIFO queue of
//!   [`WorkItem`]s in reactor or proactor [`DispatchMode`]
//! - [`ConnectionPool`]: backend connections with scoped acquire/release
//! - [`SweepSchedule`]: fixed-interval sweep trigger
//! - [`Environment`]: time source, real or simulated
//!
//! # Threading
//!
//! The timer heap is owned by a single dispatch thread. Workers communicate
//! with that thread only through [`WorkFlags`]; the dispatch thread reconciles
//! the flags against the heap. The work queue is the only structure shared
//! between the two sides.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod env;
pub mod error;
pub mod pool;
pub mod schedule;
pub mod timer;
pub mod work;

pub use backend::{ConnectionPool, PooledConnection};
pub use env::Environment;
pub use error::{BackendError, PoolError, SubmitError};
pub use pool::{DispatchMode, PoolConfig, ThreadPool};
pub use schedule::SweepSchedule;
pub use timer::{CancelToken, EvictFn, SweepReport, TimerEntry, TimerHeap, TimerId};
pub use work::{DispatchState, Outcome, WorkFlags, WorkItem};
