//! Per-connection bookkeeping held by the dispatch thread.

use std::{net::SocketAddr, sync::Arc};

use mio::Token;
use reaper_core::TimerId;

use crate::request::EchoRequest;

/// What the dispatch thread knows about one live connection.
#[derive(Debug)]
pub struct ConnectionContext {
    /// Peer address
    pub address: SocketAddr,
    /// Poll token
    pub token: Token,
    /// Request object shared with workers
    pub request: Arc<EchoRequest>,
    /// Handle of the connection's timer entry
    pub timer: TimerId,
    /// Heap position observed at the last refresh. Diagnostic only.
    pub heap_position: Option<usize>,
}
