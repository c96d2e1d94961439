//! Deterministic test harness for the reaper core.
//!
//! Simulated time, scripted work items, and reference models so that timer
//! and pool behavior can be checked without sockets or wall-clock waits.
//!
//! # Model-Based Testing
//!
//! The `model` module provides a reference implementation of the timer heap.
//! Operations are applied to both the model and the real [`TimerHeap`], and
//! their observable results are compared.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks structural properties of a heap snapshot
//! after every step. Use [`InvariantRegistry::standard()`] for the full set.
//!
//! [`TimerHeap`]: reaper_core::TimerHeap

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod model;
pub mod scripted;
pub mod sim_env;

pub use invariants::{
    EntrySnapshot, HeapOrder, HeapSnapshot, Invariant, InvariantRegistry, InvariantResult,
    LenMatchesEntries, PositionsMatchIndices, UniqueHandles, Violation,
};
pub use model::{HeapOp, ModelHeap, OpResult, RealHeap};
pub use scripted::{Gate, OrderLog, ScriptedItem, wait_for};
pub use sim_env::SimEnv;
