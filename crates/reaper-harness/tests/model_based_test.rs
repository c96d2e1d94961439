//! Model-based property tests for the timer heap.
//!
//! Random operation sequences are applied to the reference model and the real
//! heap; results must agree after every step and the heap invariants must hold
//! throughout.

use proptest::prelude::*;
use reaper_harness::{HeapOp, HeapSnapshot, InvariantRegistry, ModelHeap, OpResult, RealHeap};

fn operation_strategy() -> impl Strategy<Value = HeapOp> {
    prop_oneof![
        // Weight towards growing the heap so sweeps have work to do
        4 => any::<u8>().prop_map(|delay| HeapOp::Add { delay }),
        2 => (any::<u8>(), any::<u8>())
            .prop_map(|(target, delay)| HeapOp::Adjust { target, delay }),
        2 => any::<u8>().prop_map(|target| HeapOp::Cancel { target }),
        2 => any::<u8>().prop_map(|target| HeapOp::Remove { target }),
        2 => (0u8..64).prop_map(|advance| HeapOp::Sweep { advance }),
        1 => Just(HeapOp::Purge),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every operation returns the same observable result on model and heap.
    #[test]
    fn prop_model_matches_real(ops in prop::collection::vec(operation_strategy(), 0..120)) {
        let mut model = ModelHeap::new();
        let mut real = RealHeap::new();
        let invariants = InvariantRegistry::standard();

        for (i, op) in ops.iter().enumerate() {
            let model_result = model.apply(op);
            let real_result = real.apply(op);

            prop_assert!(real_result.is_ordered(), "out of order at {}: {:?}", i, real_result);
            prop_assert_eq!(
                model_result.normalized(),
                real_result.normalized(),
                "Divergence at operation {}: {:?}",
                i,
                op
            );

            let snapshot = HeapSnapshot::from_heap(real.heap());
            if let Err(violations) = invariants.check_all(&snapshot) {
                prop_assert!(false, "invariant violated after {:?}: {:?}", op, violations);
            }
            prop_assert_eq!(real.heap().len(), model.len());
        }
    }

    /// A long enough sweep always empties the heap.
    #[test]
    fn prop_final_sweep_drains_everything(
        delays in prop::collection::vec(any::<u8>(), 0..64),
        cancel_every in 1usize..5,
    ) {
        let mut real = RealHeap::new();
        for (i, delay) in delays.iter().enumerate() {
            real.apply(&HeapOp::Add { delay: *delay });
            if i % cancel_every == 0 {
                real.apply(&HeapOp::Cancel { target: i as u8 });
            }
        }

        for _ in 0..2 {
            real.apply(&HeapOp::Sweep { advance: u8::MAX });
        }

        prop_assert!(real.heap().is_empty());
    }
}

#[test]
fn operations_on_empty_heap_are_skipped() {
    let mut model = ModelHeap::new();
    let mut real = RealHeap::new();

    for op in [HeapOp::Cancel { target: 0 }, HeapOp::Remove { target: 1 }] {
        assert_eq!(model.apply(&op), OpResult::Skipped);
        assert_eq!(real.apply(&op), OpResult::Skipped);
    }
    assert_eq!(real.apply(&HeapOp::Purge), OpResult::Purged(0));
}
