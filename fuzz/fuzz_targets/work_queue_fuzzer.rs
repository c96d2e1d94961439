//! Fuzz target for worker pool submission
//!
//! Random pool shapes and item scripts.
//!
//! # Invariants
//!
//! - Every accepted item is processed exactly once
//! - Failed reads never reach business logic

#![no_main]

use std::{sync::Arc, time::Duration};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use reaper_core::{
    ConnectionPool, DispatchMode, DispatchState, Outcome, PoolConfig, ThreadPool, WorkItem,
};
use reaper_harness::{ScriptedItem, wait_for};

#[derive(Debug, Arbitrary)]
struct Script {
    workers: u8,
    depth: u8,
    reactor: bool,
    items: Vec<ItemScript>,
}

#[derive(Debug, Arbitrary)]
struct ItemScript {
    read_ok: bool,
    write_ok: bool,
    write: bool,
}

fuzz_target!(|script: Script| {
    let mode = if script.reactor { DispatchMode::Reactor } else { DispatchMode::Proactor };
    let config = PoolConfig {
        worker_count: usize::from(script.workers % 4) + 1,
        max_requests: usize::from(script.depth % 16) + 1,
        mode,
    };
    let backend = Arc::new(ConnectionPool::new(vec![(); config.worker_count]).unwrap());
    let pool = ThreadPool::new(config, backend).unwrap();

    let mut accepted = Vec::new();
    for (id, item) in script.items.iter().take(64).enumerate() {
        let scripted =
            Arc::new(ScriptedItem::new(id).with_read(item.read_ok).with_write(item.write_ok));
        let state = if item.write { DispatchState::Write } else { DispatchState::Read };
        if pool.submit_with_state(Arc::clone(&scripted), state).is_ok() {
            accepted.push((scripted, item));
        }
    }

    let done = wait_for(Duration::from_secs(10), || {
        accepted.iter().all(|(scripted, _)| scripted.flags().needs_followup())
    });
    assert!(done, "accepted items never completed");

    for (scripted, item) in &accepted {
        let outcome = scripted.flags().take_outcome();
        match mode {
            DispatchMode::Proactor => {
                assert_eq!(scripted.logic_runs(), 1);
                assert_eq!(outcome, Some(Outcome::Processed));
            },
            DispatchMode::Reactor if item.write => {
                assert_eq!(scripted.logic_runs(), 0);
                let expected = if item.write_ok { Outcome::Processed } else { Outcome::Failed };
                assert_eq!(outcome, Some(expected));
            },
            DispatchMode::Reactor => {
                assert_eq!(scripted.logic_runs(), usize::from(item.read_ok));
                let expected = if item.read_ok { Outcome::Processed } else { Outcome::Failed };
                assert_eq!(outcome, Some(expected));
            },
        }
    }
});
