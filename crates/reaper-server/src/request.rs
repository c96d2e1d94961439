//! Line-echo request object.
//!
//! The minimal [`WorkItem`] the binary serves: whatever a peer sends is
//! echoed back. Reading and writing follow the connection's trigger mode:
//! edge-triggered sockets are drained until `WouldBlock`, level-triggered
//! sockets do one read per readiness event.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use mio::{Registry, Token, net::TcpStream};
use reaper_core::{WorkFlags, WorkItem};

use crate::dispatcher::TriggerMode;

/// Maximum bytes buffered from a peer before business logic runs.
pub const READ_BUFFER_SIZE: usize = 2048;

const CHUNK: usize = 512;

/// Backend handle used by the echo logic.
#[derive(Debug, Default)]
pub struct BackendSession {
    /// Session index within the backend pool
    pub id: usize,
    /// Requests served through this session
    pub served: u64,
}

impl BackendSession {
    /// Open session `id`.
    pub fn open(id: usize) -> Self {
        Self { id, served: 0 }
    }
}

#[derive(Debug)]
struct Io {
    stream: Option<TcpStream>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    written: usize,
}

/// Per-connection request state shared between dispatch thread and workers.
#[derive(Debug)]
pub struct EchoRequest {
    token: Token,
    peer: SocketAddr,
    trigger: TriggerMode,
    flags: WorkFlags,
    io: Mutex<Io>,
    closed: AtomicBool,
}

impl EchoRequest {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream, token: Token, peer: SocketAddr, trigger: TriggerMode) -> Self {
        Self {
            token,
            peer,
            trigger,
            flags: WorkFlags::new(),
            io: Mutex::new(Io {
                stream: Some(stream),
                read_buf: Vec::with_capacity(READ_BUFFER_SIZE),
                write_buf: Vec::new(),
                written: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Poll token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether output is waiting to be flushed.
    pub fn wants_write(&self) -> bool {
        let state = self.lock();
        state.written < state.write_buf.len()
    }

    /// Run `f` on the stream, `None` once closed.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> Option<R> {
        self.lock().stream.as_mut().map(f)
    }

    /// Deregister and shut down the socket. Idempotent.
    ///
    /// Failures are logged; the connection is considered closed either way.
    pub fn close(&self, registry: &Registry) {
        let stream = self.lock().stream.take();
        self.closed.store(true, Ordering::Release);

        let Some(mut stream) = stream else {
            return;
        };
        if let Err(e) = registry.deregister(&mut stream) {
            tracing::warn!(token = ?self.token, "deregister failed: {}", e);
        }
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::warn!(token = ?self.token, "shutdown failed: {}", e);
            }
        }
        tracing::debug!(token = ?self.token, peer = %self.peer, "connection closed");
    }

    fn lock(&self) -> MutexGuard<'_, Io> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkItem for EchoRequest {
    type Backend = BackendSession;

    fn flags(&self) -> &WorkFlags {
        &self.flags
    }

    fn attempt_read(&self) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(stream) = state.stream.as_mut() else {
            return false;
        };

        let mut chunk = [0u8; CHUNK];
        loop {
            let room = READ_BUFFER_SIZE - state.read_buf.len();
            if room == 0 {
                return true;
            }

            match stream.read(&mut chunk[..room.min(CHUNK)]) {
                Ok(0) => return false,
                Ok(n) => {
                    state.read_buf.extend_from_slice(&chunk[..n]);
                    if self.trigger == TriggerMode::Level {
                        return true;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    tracing::debug!(token = ?self.token, "read failed: {}", e);
                    return false;
                },
            }
        }
    }

    fn attempt_write(&self) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(stream) = state.stream.as_mut() else {
            return false;
        };

        while state.written < state.write_buf.len() {
            match stream.write(&state.write_buf[state.written..]) {
                Ok(0) => return false,
                Ok(n) => state.written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    tracing::debug!(token = ?self.token, "write failed: {}", e);
                    return false;
                },
            }
        }

        state.write_buf.clear();
        state.written = 0;
        true
    }

    fn run_business_logic(&self, backend: &mut BackendSession) {
        let mut state = self.lock();
        let request = std::mem::replace(&mut state.read_buf, Vec::with_capacity(READ_BUFFER_SIZE));
        state.write_buf.extend_from_slice(&request);

        backend.served += 1;
        tracing::trace!(
            token = ?self.token,
            bytes = request.len(),
            session = backend.id,
            "echoed request"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, time::Duration};

    use super::*;

    fn pair(trigger: TriggerMode) -> (EchoRequest, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (EchoRequest::new(TcpStream::from_std(server), Token(0), peer, trigger), client)
    }

    fn read_until_available(request: &EchoRequest) {
        for _ in 0..100 {
            assert!(request.attempt_read());
            if !request.lock().read_buf.is_empty() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn echo_round_trip() {
        let (request, mut client) = pair(TriggerMode::Edge);
        client.write_all(b"hello\n").unwrap();
        read_until_available(&request);

        let mut session = BackendSession::open(0);
        request.run_business_logic(&mut session);
        assert_eq!(session.served, 1);
        assert!(request.wants_write());

        assert!(request.attempt_write());
        assert!(!request.wants_write());

        let mut echoed = [0u8; 6];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello\n");
    }

    #[test]
    fn peer_close_fails_read() {
        let (request, client) = pair(TriggerMode::Level);
        drop(client);

        let mut failed = false;
        for _ in 0..100 {
            if !request.attempt_read() {
                failed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(failed);
    }

    #[test]
    fn close_is_idempotent() {
        let (request, _client) = pair(TriggerMode::Level);
        let poll = mio::Poll::new().unwrap();

        request.close(poll.registry());
        request.close(poll.registry());

        assert!(request.is_closed());
        assert!(!request.attempt_read());
        assert!(!request.attempt_write());
        assert!(request.with_stream(|_| ()).is_none());
    }
}
