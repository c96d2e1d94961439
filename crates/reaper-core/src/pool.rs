//! Bounded work queue drained by a fixed set of worker threads.
//!
//! # Architecture
//!
//! ```text
//!   dispatch thread                         worker threads
//!   ───────────────                         ──────────────
//!   submit / submit_with_state              loop {
//!        │                                    wait on `available`
//!        ▼                                    pop_front under lock
//!   ┌──────────────────────────────┐          drop lock
//!   │ Mutex<VecDeque<Arc<T>>>      │ ───────> reactor: read|write, then logic
//!   │ len < max_requests, FIFO     │          proactor: logic only
//!   └──────────────────────────────┘          flags + completion hook
//!        │ notify_one per enqueue           }
//! ```
//!
//! The queue lock is never held while a worker performs I/O or business logic.
//! Submission rejects instead of blocking when the queue is full; the caller
//! decides what to do with the connection.

use std::{
    collections::VecDeque,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use crate::{
    backend::ConnectionPool,
    error::{PoolError, SubmitError},
    work::{DispatchState, WorkItem},
};

/// Default number of worker threads.
pub const DEFAULT_WORKER_COUNT: usize = 8;

/// Default maximum queue depth.
pub const DEFAULT_MAX_REQUESTS: usize = 10_000;

/// Who performs socket I/O.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// The dispatch thread completes I/O; workers only run business logic
    #[default]
    Proactor,
    /// Workers perform the non-blocking read or write themselves
    Reactor,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads, fixed for the pool's lifetime
    pub worker_count: usize,
    /// Maximum queued items; submissions beyond this are rejected
    pub max_requests: usize,
    /// I/O ownership model
    pub mode: DispatchMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_requests: DEFAULT_MAX_REQUESTS,
            mode: DispatchMode::default(),
        }
    }
}

impl PoolConfig {
    /// Check the configuration before any thread is started.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.worker_count == 0 {
            return Err(PoolError::InvalidConfig("worker_count must be > 0".to_string()));
        }
        if self.max_requests == 0 {
            return Err(PoolError::InvalidConfig("max_requests must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Called by a worker after each item, from the worker thread.
type CompletionHook<T> = Box<dyn Fn(&Arc<T>) + Send + Sync>;

/// Body of one worker thread.
type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

struct Queue<T> {
    items: VecDeque<Arc<T>>,
    shutdown: bool,
}

struct Shared<T: WorkItem> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
    config: PoolConfig,
    backend: Arc<ConnectionPool<T::Backend>>,
    on_complete: Option<CompletionHook<T>>,
}

/// Fixed-size worker pool over a bounded FIFO queue.
pub struct ThreadPool<T: WorkItem> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: WorkItem> ThreadPool<T> {
    /// Start `config.worker_count` workers.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidConfig` for a zero worker count or queue depth
    /// - `PoolError::Spawn` if a thread cannot be started; workers already
    ///   running are stopped and joined first
    pub fn new(
        config: PoolConfig,
        backend: Arc<ConnectionPool<T::Backend>>,
    ) -> Result<Self, PoolError> {
        Self::start(config, backend, None)
    }

    /// Like [`ThreadPool::new`], calling `on_complete` after each item.
    ///
    /// The hook runs on the worker thread once the item's flags are set. The
    /// server uses it to wake its dispatch loop.
    pub fn with_completion_hook(
        config: PoolConfig,
        backend: Arc<ConnectionPool<T::Backend>>,
        on_complete: impl Fn(&Arc<T>) + Send + Sync + 'static,
    ) -> Result<Self, PoolError> {
        Self::start(config, backend, Some(Box::new(on_complete)))
    }

    fn start(
        config: PoolConfig,
        backend: Arc<ConnectionPool<T::Backend>>,
        on_complete: Option<CompletionHook<T>>,
    ) -> Result<Self, PoolError> {
        Self::start_with(config, backend, on_complete, |builder, body| builder.spawn(body))
    }

    fn start_with<F>(
        config: PoolConfig,
        backend: Arc<ConnectionPool<T::Backend>>,
        on_complete: Option<CompletionHook<T>>,
        mut spawn: F,
    ) -> Result<Self, PoolError>
    where
        F: FnMut(thread::Builder, WorkerBody) -> io::Result<JoinHandle<()>>,
    {
        config.validate()?;

        let worker_count = config.worker_count;
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue { items: VecDeque::new(), shutdown: false }),
            available: Condvar::new(),
            config,
            backend,
            on_complete,
        });

        let mut pool = Self { shared, workers: Vec::with_capacity(worker_count) };
        for worker in 0..worker_count {
            let shared = Arc::clone(&pool.shared);
            let builder = thread::Builder::new().name(format!("reaper-worker-{worker}"));
            let spawned = spawn(builder, Box::new(move || run_worker(worker, &shared)));

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(source) => {
                    tracing::error!(worker, "failed to spawn worker: {}", source);
                    pool.stop();
                    return Err(PoolError::Spawn { worker, source });
                },
            }
        }

        tracing::debug!(
            workers = worker_count,
            max_requests = pool.shared.config.max_requests,
            mode = ?pool.shared.config.mode,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Queue an item whose I/O is already done (proactor submission).
    ///
    /// # Errors
    ///
    /// - `SubmitError::QueueFull` if `max_requests` items are already queued
    /// - `SubmitError::ShutDown` after shutdown
    pub fn submit(&self, item: Arc<T>) -> Result<(), SubmitError<T>> {
        self.enqueue(item, None)
    }

    /// Queue an item for a reactor-mode read or write.
    ///
    /// The state is stamped only once the item is accepted.
    pub fn submit_with_state(
        &self,
        item: Arc<T>,
        state: DispatchState,
    ) -> Result<(), SubmitError<T>> {
        self.enqueue(item, Some(state))
    }

    fn enqueue(&self, item: Arc<T>, state: Option<DispatchState>) -> Result<(), SubmitError<T>> {
        {
            let mut queue = self.shared.lock();
            if queue.shutdown {
                return Err(SubmitError::ShutDown(item));
            }
            if queue.items.len() >= self.shared.config.max_requests {
                return Err(SubmitError::QueueFull(item));
            }
            if let Some(state) = state {
                item.flags().set_dispatch_state(state);
            }
            queue.items.push_back(item);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.config.worker_count
    }

    /// Configured queue depth.
    pub fn max_requests(&self) -> usize {
        self.shared.config.max_requests
    }

    /// Configured dispatch mode.
    pub fn mode(&self) -> DispatchMode {
        self.shared.config.mode
    }

    /// Backend pool shared by the workers.
    pub fn backend(&self) -> &Arc<ConnectionPool<T::Backend>> {
        &self.shared.backend
    }

    /// Stop accepting work, let in-flight items finish, join every worker.
    ///
    /// Returns the items that were still queued so the caller can close
    /// their connections.
    pub fn shutdown(mut self) -> Vec<Arc<T>> {
        self.stop()
    }

    fn stop(&mut self) -> Vec<Arc<T>> {
        let pending: Vec<_> = {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            queue.items.drain(..).collect()
        };
        self.shared.available.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }

        if !pending.is_empty() {
            tracing::debug!(pending = pending.len(), "worker pool stopped with queued items");
        }
        pending
    }
}

impl<T: WorkItem> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

impl<T: WorkItem> fmt::Debug for ThreadPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("config", &self.shared.config)
            .field("workers", &self.workers.len())
            .field("queued", &self.queued())
            .finish()
    }
}

impl<T: WorkItem> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until an item is available. `None` once the pool shuts down.
    fn next_item(&self) -> Option<Arc<T>> {
        let mut queue = self.lock();
        loop {
            if queue.shutdown {
                return None;
            }
            if let Some(item) = queue.items.pop_front() {
                return Some(item);
            }
            queue = self.available.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn process(&self, item: &T) {
        let flags = item.flags();
        match self.config.mode {
            DispatchMode::Reactor => match flags.dispatch_state() {
                DispatchState::Read => {
                    if item.attempt_read() && self.run_business_logic(item) {
                        flags.mark_processed();
                    } else {
                        flags.mark_failed();
                    }
                },
                DispatchState::Write => {
                    if item.attempt_write() {
                        flags.mark_processed();
                    } else {
                        flags.mark_failed();
                    }
                },
            },
            DispatchMode::Proactor => {
                if self.run_business_logic(item) {
                    flags.mark_processed();
                } else {
                    flags.mark_failed();
                }
            },
        }
    }

    /// Run business logic with a backend connection checked out for its
    /// duration. `false` if no connection could be obtained.
    fn run_business_logic(&self, item: &T) -> bool {
        match self.backend.acquire() {
            Ok(mut connection) => {
                item.run_business_logic(&mut connection);
                true
            },
            Err(e) => {
                tracing::warn!("backend unavailable, failing work item: {}", e);
                false
            },
        }
    }
}

fn run_worker<T: WorkItem>(worker: usize, shared: &Shared<T>) {
    tracing::trace!(worker, "worker started");

    while let Some(item) = shared.next_item() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| shared.process(&item)));
        if result.is_err() {
            tracing::error!(worker, "work item panicked; marking it for eviction");
            item.flags().mark_failed();
        }

        if let Some(on_complete) = &shared.on_complete {
            on_complete(&item);
        }
    }

    tracing::trace!(worker, "worker stopped");
}
