//! Scripted work items for driving the worker pool in tests.
//!
//! A [`ScriptedItem`] succeeds or fails its I/O as configured, counts every
//! call, and can block inside business logic on a [`Gate`] so tests can pin
//! workers and fill the queue deterministically.

use std::{
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use reaper_core::{WorkFlags, WorkItem};

/// Order in which business logic ran, by item id.
pub type OrderLog = Arc<Mutex<Vec<usize>>>;

/// One-shot barrier that holds business logic until opened.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    /// Closed gate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Release every current and future waiter.
    pub fn open(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.opened.notify_all();
    }

    /// Number of threads blocked on the gate right now.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn pass(&self) {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.opened.wait_while(open, |open| !*open);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        drop(guard.unwrap_or_else(PoisonError::into_inner));
    }
}

/// Mock request object with configurable I/O results.
#[derive(Debug)]
pub struct ScriptedItem {
    id: usize,
    flags: WorkFlags,
    read_ok: AtomicBool,
    write_ok: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
    logic_runs: AtomicUsize,
    gate: Option<Arc<Gate>>,
    order: Option<OrderLog>,
}

impl ScriptedItem {
    /// Item whose reads and writes succeed.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            flags: WorkFlags::new(),
            read_ok: AtomicBool::new(true),
            write_ok: AtomicBool::new(true),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            logic_runs: AtomicUsize::new(0),
            gate: None,
            order: None,
        }
    }

    /// Make `attempt_read` report the given result.
    #[must_use]
    pub fn with_read(self, ok: bool) -> Self {
        self.read_ok.store(ok, Ordering::SeqCst);
        self
    }

    /// Make `attempt_write` report the given result.
    #[must_use]
    pub fn with_write(self, ok: bool) -> Self {
        self.write_ok.store(ok, Ordering::SeqCst);
        self
    }

    /// Block business logic until `gate` opens.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Append this item's id to `order` when its business logic runs.
    #[must_use]
    pub fn with_order(mut self, order: OrderLog) -> Self {
        self.order = Some(order);
        self
    }

    /// Item id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Calls to `attempt_read`.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Calls to `attempt_write`.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Completed business-logic runs.
    pub fn logic_runs(&self) -> usize {
        self.logic_runs.load(Ordering::SeqCst)
    }
}

impl WorkItem for ScriptedItem {
    type Backend = ();

    fn flags(&self) -> &WorkFlags {
        &self.flags
    }

    fn attempt_read(&self) -> bool {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.read_ok.load(Ordering::SeqCst)
    }

    fn attempt_write(&self) -> bool {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.write_ok.load(Ordering::SeqCst)
    }

    fn run_business_logic(&self, _backend: &mut ()) {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if let Some(order) = &self.order {
            order.lock().unwrap_or_else(PoisonError::into_inner).push(self.id);
        }
        self.logic_runs.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was observed.
#[allow(clippy::disallowed_methods)]
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
