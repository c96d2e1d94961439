//! Fuzz target for the timer heap
//!
//! Drives the real heap and the reference model with the same operation
//! stream.
//!
//! # Invariants
//!
//! - Every operation returns the same observable result on model and heap
//! - Sweeps fire callbacks in non-decreasing expiry order
//! - Heap order, recorded positions and handle uniqueness hold after every step

#![no_main]

use libfuzzer_sys::fuzz_target;
use reaper_harness::{HeapOp, HeapSnapshot, InvariantRegistry, ModelHeap, RealHeap};

fuzz_target!(|ops: Vec<HeapOp>| {
    let mut model = ModelHeap::new();
    let mut real = RealHeap::new();
    let invariants = InvariantRegistry::standard();

    for op in &ops {
        let real_result = real.apply(op);
        assert!(real_result.is_ordered(), "sweep out of order: {real_result:?}");
        assert_eq!(model.apply(op).normalized(), real_result.normalized(), "diverged on {op:?}");

        invariants.assert_all(&HeapSnapshot::from_heap(real.heap()), "after fuzz op");
    }

    assert_eq!(model.len(), real.heap().len());
});
