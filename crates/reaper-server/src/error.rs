//! Server error types.

use std::io;

use mio::Token;
use reaper_core::{BackendError, PoolError};
use thiserror::Error;

/// Errors from descriptor registration, polling and signal bridging.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Registering a descriptor with the multiplexer failed.
    #[error("failed to register {token:?}: {source}")]
    Register {
        /// Token the descriptor was to be registered under
        token: Token,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Operation on a token the dispatcher does not know.
    #[error("unknown registration {0:?}")]
    UnknownToken(Token),

    /// Another signal bridge is already installed in this process.
    #[error("a signal bridge is already installed")]
    SignalsInstalled,

    /// A signal was added before the bridge was installed.
    #[error("signal bridge not installed")]
    SignalsNotInstalled,

    /// Any other OS-level failure (poll, pipe, fcntl, sigaction).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl DispatchError {
    /// Returns true if retrying the same call may succeed.
    ///
    /// Interrupted or would-block OS errors are transient; misuse of the
    /// dispatcher is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) | Self::Register { source: e, .. } => {
                matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            },
            Self::UnknownToken(_) | Self::SignalsInstalled | Self::SignalsNotInstalled => false,
        }
    }
}

/// Errors that stop the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration (bind address, counts).
    #[error("configuration error: {0}")]
    Config(String),

    /// Listener or socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Event dispatcher failure.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Worker pool could not be started.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Backend pool could not be created.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl ServerError {
    /// Returns true if the failed operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Dispatch(e) => e.is_transient(),
            Self::Transport(e) => {
                matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            },
            Self::Config(_) | Self::Pool(_) | Self::Backend(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_poll_is_transient() {
        let err = DispatchError::from(io::Error::from(io::ErrorKind::Interrupted));
        assert!(err.is_transient());
        assert!(ServerError::from(err).is_transient());
    }

    #[test]
    fn misuse_is_fatal() {
        assert!(!DispatchError::SignalsInstalled.is_transient());
        assert!(!ServerError::Config("max_connections must be > 0".into()).is_transient());
        assert_eq!(
            DispatchError::UnknownToken(Token(7)).to_string(),
            "unknown registration Token(7)"
        );
    }
}
