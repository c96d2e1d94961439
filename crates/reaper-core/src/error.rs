//! Error types for the reaper core.
//!
//! Strongly-typed errors for the worker pool (construction and submission)
//! and the backend connection pool. Submission failure is an expected outcome
//! under load, so [`SubmitError`] hands the rejected item back to the caller
//! instead of dropping it.

use std::{fmt, io, sync::Arc};

use thiserror::Error;

/// Errors that can occur while building a [`ThreadPool`](crate::ThreadPool).
///
/// All of these are fatal at construction: no partially started pool is ever
/// returned.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Configuration rejected before any thread was started
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The OS refused to start a worker thread
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        /// Index of the worker that could not be started
        worker: usize,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },
}

/// Rejected submission. The item is returned so the caller can close or retry
/// the connection it belongs to.
#[derive(Error)]
pub enum SubmitError<T> {
    /// Queue is at its configured depth
    #[error("work queue full")]
    QueueFull(Arc<T>),

    /// Pool is shutting down and no longer accepts work
    #[error("worker pool is shut down")]
    ShutDown(Arc<T>),
}

impl<T> SubmitError<T> {
    /// The rejected item.
    pub fn into_item(self) -> Arc<T> {
        match self {
            Self::QueueFull(item) | Self::ShutDown(item) => item,
        }
    }

    /// Returns true if the same submission may succeed once workers catch up.
    ///
    /// A full queue drains; a shut down pool never accepts work again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueFull(_))
    }
}

impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull(_) => f.write_str("QueueFull(..)"),
            Self::ShutDown(_) => f.write_str("ShutDown(..)"),
        }
    }
}

/// Errors from the backend connection pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Pool was created without any connections
    #[error("backend pool needs at least one connection")]
    Empty,

    /// Pool was closed; no further connections are handed out
    #[error("backend pool closed")]
    Closed,

    /// No connection was released within the allowed wait
    #[error("no backend connection available")]
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_error_returns_item() {
        let item = Arc::new(7u32);
        let err = SubmitError::QueueFull(Arc::clone(&item));
        assert!(err.is_transient());
        assert_eq!(*err.into_item(), 7);

        let err = SubmitError::ShutDown(item);
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "worker pool is shut down");
    }

    #[test]
    fn pool_error_display() {
        let err = PoolError::InvalidConfig("worker_count must be > 0".to_string());
        assert_eq!(err.to_string(), "invalid pool configuration: worker_count must be > 0");

        let err = PoolError::Spawn { worker: 3, source: io::Error::other("EAGAIN") };
        assert_eq!(err.to_string(), "failed to spawn worker 3: EAGAIN");
    }

    #[test]
    fn backend_error_display() {
        assert_eq!(BackendError::Closed.to_string(), "backend pool closed");
        assert_eq!(BackendError::Exhausted.to_string(), "no backend connection available");
    }
}
