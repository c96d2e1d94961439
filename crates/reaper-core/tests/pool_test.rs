//! Worker pool behavior under load.
//!
//! Workers are pinned with gated items so queue depth and ordering can be
//! observed without timing assumptions.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use reaper_core::{
    ConnectionPool, DispatchMode, DispatchState, Outcome, PoolConfig, SubmitError, ThreadPool,
    WorkItem,
};
use reaper_harness::{Gate, OrderLog, ScriptedItem, wait_for};

const WAIT: Duration = Duration::from_secs(5);

fn backend(size: usize) -> Arc<ConnectionPool<()>> {
    Arc::new(ConnectionPool::new(vec![(); size]).unwrap())
}

fn pool(workers: usize, depth: usize, mode: DispatchMode) -> ThreadPool<ScriptedItem> {
    let config = PoolConfig { worker_count: workers, max_requests: depth, mode };
    ThreadPool::new(config, backend(workers)).unwrap()
}

/// Occupy every worker with a gated item and wait until all are blocked.
fn pin_workers(pool: &ThreadPool<ScriptedItem>, gate: &Arc<Gate>) -> Vec<Arc<ScriptedItem>> {
    let blockers: Vec<_> = (0..pool.worker_count())
        .map(|i| Arc::new(ScriptedItem::new(1000 + i).with_gate(Arc::clone(gate))))
        .collect();
    for item in &blockers {
        pool.submit(Arc::clone(item)).unwrap();
    }
    assert!(wait_for(WAIT, || gate.waiting() == pool.worker_count()), "workers never blocked");
    blockers
}

#[test]
fn queue_accepts_exactly_max_requests() {
    let pool = pool(2, 4, DispatchMode::Proactor);
    let gate = Gate::new();
    let _blockers = pin_workers(&pool, &gate);

    for i in 0..4 {
        pool.submit(Arc::new(ScriptedItem::new(i))).unwrap();
    }
    assert_eq!(pool.queued(), 4);

    let rejected = Arc::new(ScriptedItem::new(99));
    let err = pool.submit(Arc::clone(&rejected)).unwrap_err();
    assert!(matches!(err, SubmitError::QueueFull(_)));
    assert!(err.is_transient());
    assert!(Arc::ptr_eq(&err.into_item(), &rejected));
    assert_eq!(pool.queued(), 4, "rejection leaves the queue untouched");

    gate.open();
    assert!(wait_for(WAIT, || pool.queued() == 0));
}

#[test]
fn rejected_reactor_submission_keeps_its_state() {
    let pool = pool(1, 1, DispatchMode::Reactor);
    let gate = Gate::new();
    let _blockers = pin_workers(&pool, &gate);

    pool.submit_with_state(Arc::new(ScriptedItem::new(0)), DispatchState::Read).unwrap();

    let rejected = Arc::new(ScriptedItem::new(1));
    assert!(pool.submit_with_state(Arc::clone(&rejected), DispatchState::Write).is_err());
    assert_eq!(rejected.flags().dispatch_state(), DispatchState::Read);

    gate.open();
}

#[test]
fn single_worker_processes_in_submission_order() {
    let pool = pool(1, 16, DispatchMode::Proactor);
    let gate = Gate::new();
    let _blockers = pin_workers(&pool, &gate);

    let order = OrderLog::default();
    let items: Vec<_> = (0..10)
        .map(|i| Arc::new(ScriptedItem::new(i).with_order(Arc::clone(&order))))
        .collect();
    for item in &items {
        pool.submit(Arc::clone(item)).unwrap();
    }

    gate.open();
    assert!(wait_for(WAIT, || order.lock().unwrap().len() == 10));
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn reactor_read_failure_requests_eviction() {
    let pool = pool(1, 4, DispatchMode::Reactor);
    let item = Arc::new(ScriptedItem::new(0).with_read(false));

    pool.submit_with_state(Arc::clone(&item), DispatchState::Read).unwrap();
    assert!(wait_for(WAIT, || item.flags().needs_followup()));

    assert!(item.flags().needs_timer_action());
    assert_eq!(item.reads(), 1);
    assert_eq!(item.logic_runs(), 0, "business logic skipped after a failed read");
    assert_eq!(item.flags().take_outcome(), Some(Outcome::Failed));
}

#[test]
fn reactor_read_success_runs_logic() {
    let pool = pool(1, 4, DispatchMode::Reactor);
    let item = Arc::new(ScriptedItem::new(0));

    pool.submit_with_state(Arc::clone(&item), DispatchState::Read).unwrap();
    assert!(wait_for(WAIT, || item.flags().needs_followup()));

    assert_eq!((item.reads(), item.logic_runs(), item.writes()), (1, 1, 0));
    assert_eq!(item.flags().take_outcome(), Some(Outcome::Processed));
}

#[test]
fn reactor_write_does_not_run_logic() {
    let pool = pool(1, 4, DispatchMode::Reactor);
    let ok = Arc::new(ScriptedItem::new(0));
    let broken = Arc::new(ScriptedItem::new(1).with_write(false));

    pool.submit_with_state(Arc::clone(&ok), DispatchState::Write).unwrap();
    pool.submit_with_state(Arc::clone(&broken), DispatchState::Write).unwrap();
    assert!(wait_for(WAIT, || ok.flags().needs_followup() && broken.flags().needs_followup()));

    assert_eq!((ok.writes(), ok.logic_runs()), (1, 0));
    assert_eq!(ok.flags().take_outcome(), Some(Outcome::Processed));
    assert_eq!(broken.flags().take_outcome(), Some(Outcome::Failed));
}

#[test]
fn proactor_skips_worker_io() {
    let pool = pool(2, 4, DispatchMode::Proactor);
    let item = Arc::new(ScriptedItem::new(0).with_read(false));

    pool.submit(Arc::clone(&item)).unwrap();
    assert!(wait_for(WAIT, || item.flags().needs_followup()));

    assert_eq!((item.reads(), item.writes(), item.logic_runs()), (0, 0, 1));
    assert_eq!(item.flags().take_outcome(), Some(Outcome::Processed));
}

#[test]
fn concurrent_producers_each_item_processed_once() {
    let completions = Arc::new(Mutex::new(Vec::new()));
    let hook_log = Arc::clone(&completions);
    let config = PoolConfig { worker_count: 4, max_requests: 10, mode: DispatchMode::Proactor };
    let pool = Arc::new(
        ThreadPool::with_completion_hook(config, backend(4), move |item: &Arc<ScriptedItem>| {
            hook_log.lock().unwrap().push(item.id());
        })
        .unwrap(),
    );

    let items: Vec<_> = (0..10).map(|i| Arc::new(ScriptedItem::new(i))).collect();
    let producers: Vec<_> = items
        .chunks(4)
        .map(|chunk| {
            let pool = Arc::clone(&pool);
            let chunk: Vec<_> = chunk.to_vec();
            thread::spawn(move || {
                for item in chunk {
                    pool.submit(item).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_for(WAIT, || completions.lock().unwrap().len() == 10));
    let mut seen = completions.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());

    for item in &items {
        assert_eq!(item.logic_runs(), 1);
        assert_eq!(item.flags().take_outcome(), Some(Outcome::Processed));
    }
}

#[test]
fn closed_backend_fails_items() {
    let backend = backend(1);
    let config = PoolConfig { worker_count: 1, max_requests: 4, mode: DispatchMode::Proactor };
    let pool = ThreadPool::new(config, Arc::clone(&backend)).unwrap();
    backend.close();

    let item = Arc::new(ScriptedItem::new(0));
    pool.submit(Arc::clone(&item)).unwrap();
    assert!(wait_for(WAIT, || item.flags().needs_followup()));

    assert_eq!(item.logic_runs(), 0);
    assert_eq!(item.flags().take_outcome(), Some(Outcome::Failed));
}

#[test]
fn shutdown_hands_back_queued_items() {
    let pool = pool(1, 8, DispatchMode::Proactor);
    let gate = Gate::new();
    let blockers = pin_workers(&pool, &gate);

    for i in 0..3 {
        pool.submit(Arc::new(ScriptedItem::new(i))).unwrap();
    }

    let opener = Arc::clone(&gate);
    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        opener.open();
    });
    let pending = pool.shutdown();
    release.join().unwrap();

    let ids: Vec<_> = pending.iter().map(|item| item.id()).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(blockers[0].logic_runs(), 1, "in-flight item finished before join");
}
