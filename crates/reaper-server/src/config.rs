//! Server configuration.

use std::time::Duration;

use reaper_core::PoolConfig;

use crate::{dispatcher::TriggerMode, error::ServerError};

/// Sweep interval in seconds.
pub const TIMESLOT: u64 = 5;

/// Upper bound on simultaneously open client connections.
pub const MAX_CONNECTIONS: usize = 65_536;

/// Trigger modes per descriptor class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Listening socket
    pub listener: TriggerMode,
    /// Accepted client sockets
    pub connection: TriggerMode,
}

impl TriggerConfig {
    /// Decode the combined switch: `0` LT+LT, `1` LT+ET, `2` ET+LT, `3` ET+ET
    /// (listener first).
    pub fn from_combined(mode: u8) -> Option<Self> {
        use TriggerMode::{Edge, Level};

        let (listener, connection) = match mode {
            0 => (Level, Level),
            1 => (Level, Edge),
            2 => (Edge, Level),
            3 => (Edge, Edge),
            _ => return None,
        };
        Some(Self { listener, connection })
    }
}

/// Runtime configuration for [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:9006")
    pub bind_address: String,
    /// Worker pool settings
    pub pool: PoolConfig,
    /// Period of the idle sweep
    pub sweep_interval: Duration,
    /// Inactivity after which a connection is evicted
    pub idle_timeout: Duration,
    /// Trigger modes for listener and connections
    pub trigger: TriggerConfig,
    /// Connections beyond this are rejected with an error message
    pub max_connections: usize,
    /// Size of the backend connection pool
    pub backend_connections: usize,
    /// Close accepted sockets gracefully with a 1 s linger
    pub linger: bool,
    /// Route SIGTERM/SIGINT/SIGALRM through the dispatcher and ignore SIGPIPE
    pub handle_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9006".to_string(),
            pool: PoolConfig::default(),
            sweep_interval: Duration::from_secs(TIMESLOT),
            idle_timeout: Duration::from_secs(3 * TIMESLOT),
            trigger: TriggerConfig::default(),
            max_connections: MAX_CONNECTIONS,
            backend_connections: 8,
            linger: false,
            handle_signals: true,
        }
    }
}

impl ServerConfig {
    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be > 0".to_string()));
        }
        if self.backend_connections == 0 {
            return Err(ServerError::Config("backend_connections must be > 0".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ServerError::Config("sweep_interval must be > 0".to_string()));
        }
        self.pool.validate()?;
        Ok(())
    }
}
