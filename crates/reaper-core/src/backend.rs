//! Backend connection pool with scoped checkout.
//!
//! A fixed set of long-lived backend connections (database handles, upstream
//! sessions) shared by all workers. A worker checks one out for the duration
//! of a single business-logic call; the [`PooledConnection`] guard puts it
//! back on drop, on every path, including unwinding.

use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::error::BackendError;

struct Idle<C> {
    connections: VecDeque<C>,
    closed: bool,
}

/// Fixed-size pool of backend connections.
pub struct ConnectionPool<C> {
    idle: Mutex<Idle<C>>,
    released: Condvar,
    max_connections: usize,
}

impl<C> ConnectionPool<C> {
    /// Create a pool owning `connections`.
    ///
    /// # Errors
    ///
    /// - `BackendError::Empty` if `connections` is empty
    pub fn new(connections: Vec<C>) -> Result<Self, BackendError> {
        if connections.is_empty() {
            return Err(BackendError::Empty);
        }

        let max_connections = connections.len();
        Ok(Self {
            idle: Mutex::new(Idle { connections: connections.into(), closed: false }),
            released: Condvar::new(),
            max_connections,
        })
    }

    /// Create a pool of `count` connections built by `connect`.
    ///
    /// Stops at the first connection that fails to open.
    pub fn connect<E>(
        count: usize,
        mut connect: impl FnMut(usize) -> Result<C, E>,
    ) -> Result<Result<Self, BackendError>, E> {
        let connections = (0..count).map(&mut connect).collect::<Result<Vec<_>, E>>()?;
        Ok(Self::new(connections))
    }

    /// Check out a connection, blocking until one is free.
    ///
    /// # Errors
    ///
    /// - `BackendError::Closed` if the pool was closed before or while waiting
    pub fn acquire(&self) -> Result<PooledConnection<'_, C>, BackendError> {
        let mut idle = self.lock();
        loop {
            if idle.closed {
                return Err(BackendError::Closed);
            }
            if let Some(connection) = idle.connections.pop_front() {
                return Ok(PooledConnection { pool: self, connection: Some(connection) });
            }
            idle = self.released.wait(idle).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Check out a connection, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - `BackendError::Closed` if the pool is closed
    /// - `BackendError::Exhausted` if nothing was released in time
    pub fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<'_, C>, BackendError> {
        let idle = self.lock();
        let (mut idle, _) = self
            .released
            .wait_timeout_while(idle, timeout, |idle| !idle.closed && idle.connections.is_empty())
            .unwrap_or_else(PoisonError::into_inner);

        if idle.closed {
            return Err(BackendError::Closed);
        }
        idle.connections
            .pop_front()
            .map(|connection| PooledConnection { pool: self, connection: Some(connection) })
            .ok_or(BackendError::Exhausted)
    }

    /// Check out a connection only if one is free right now.
    pub fn try_acquire(&self) -> Option<PooledConnection<'_, C>> {
        let mut idle = self.lock();
        if idle.closed {
            return None;
        }
        idle.connections
            .pop_front()
            .map(|connection| PooledConnection { pool: self, connection: Some(connection) })
    }

    /// Connections currently idle in the pool.
    pub fn free_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Size the pool was created with.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Stop handing out connections and return the idle ones.
    ///
    /// Waiters wake up with `BackendError::Closed`. Connections checked out
    /// at this point are dropped when their guards release them.
    pub fn close(&self) -> Vec<C> {
        let drained = {
            let mut idle = self.lock();
            idle.closed = true;
            idle.connections.drain(..).collect()
        };
        self.released.notify_all();
        tracing::debug!("backend pool closed");
        drained
    }

    fn lock(&self) -> MutexGuard<'_, Idle<C>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, connection: C) {
        {
            let mut idle = self.lock();
            if idle.closed {
                return;
            }
            idle.connections.push_back(connection);
        }
        self.released.notify_one();
    }
}

impl<C> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_connections", &self.max_connections)
            .field("free", &self.free_count())
            .finish()
    }
}

/// Checked-out backend connection, returned to its pool on drop.
pub struct PooledConnection<'a, C> {
    pool: &'a ConnectionPool<C>,
    connection: Option<C>,
}

impl<C> Deref for PooledConnection<'_, C> {
    type Target = C;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &C {
        self.connection.as_ref().expect("invariant: connection present until drop")
    }
}

impl<C> DerefMut for PooledConnection<'_, C> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut C {
        self.connection.as_mut().expect("invariant: connection present until drop")
    }
}

impl<C> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn empty_pool_is_rejected() {
        assert_eq!(ConnectionPool::<u8>::new(Vec::new()).unwrap_err(), BackendError::Empty);
    }

    #[test]
    fn guard_releases_on_drop() {
        let pool = ConnectionPool::new(vec![1, 2]).unwrap();
        {
            let first = pool.acquire().unwrap();
            let second = pool.try_acquire().unwrap();
            assert_eq!((*first, *second), (1, 2));
            assert_eq!(pool.free_count(), 0);
            assert!(pool.try_acquire().is_none());
        }
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.max_connections(), 2);
    }

    #[test]
    #[allow(clippy::panic)]
    fn guard_releases_on_unwind() {
        let pool = Arc::new(ConnectionPool::new(vec![0u32]).unwrap());
        let worker_pool = Arc::clone(&pool);

        let result = thread::spawn(move || {
            let mut connection = worker_pool.acquire().unwrap();
            *connection += 1;
            panic!("business logic failed");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(pool.free_count(), 1);
        assert_eq!(*pool.acquire().unwrap(), 1);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(ConnectionPool::new(vec!["db"]).unwrap());
        let held = pool.acquire().unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || waiter_pool.acquire().map(|c| *c));

        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert_eq!(waiter.join().unwrap(), Ok("db"));
    }

    #[test]
    fn acquire_timeout_reports_exhaustion() {
        let pool = ConnectionPool::new(vec![()]).unwrap();
        let _held = pool.acquire().unwrap();
        assert_eq!(
            pool.acquire_timeout(Duration::from_millis(10)).err(),
            Some(BackendError::Exhausted)
        );
    }

    #[test]
    fn close_wakes_waiters() {
        let pool = Arc::new(ConnectionPool::new(vec![()]).unwrap());
        let held = pool.acquire().unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || waiter_pool.acquire().err());

        thread::sleep(Duration::from_millis(20));
        assert!(pool.close().is_empty());
        assert_eq!(waiter.join().unwrap(), Some(BackendError::Closed));

        drop(held);
        assert_eq!(pool.free_count(), 0, "released connections are dropped after close");
    }

    #[test]
    fn connect_stops_at_first_failure() {
        let result = ConnectionPool::<usize>::connect(4, |i| if i < 2 { Ok(i) } else { Err(i) });
        assert_eq!(result.err(), Some(2));

        let pool = ConnectionPool::connect(3, Ok::<usize, ()>).unwrap().unwrap();
        assert_eq!(pool.free_count(), 3);
    }
}
