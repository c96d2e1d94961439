//! Reaper connection server.
//!
//! Event-driven TCP server that evicts idle connections and hands ready
//! connections to a worker pool.
//!
//! # Architecture
//!
//! One dispatch thread owns the [`EventDispatcher`] (poll, signal pipe, sweep
//! schedule), the timer heap and the connection table. Workers from
//! [`reaper_core::ThreadPool`] perform I/O (reactor mode) or only business
//! logic (proactor mode), record the outcome in the request's flags and wake
//! the dispatch thread, which then refreshes or evicts the connection.
//!
//! ```text
//!   mio::Poll ──> EventDispatcher ──> Server::run
//!                                       ├─ LISTENER_TOKEN: accept, cap, register, arm timer
//!                                       ├─ SIGNAL_TOKEN:   stop / force sweep
//!                                       ├─ WAKE_TOKEN:     reconcile worker outcomes
//!                                       └─ connection:     submit to ThreadPool
//! ```
//!
//! # Components
//!
//! - [`Server`]: accept loop, connection table, flag reconciliation
//! - [`EventDispatcher`]: registration, one-shot/level emulation, signals
//! - [`EchoRequest`]: the line-echo work item served by the binary
//! - [`SystemEnv`]: production environment (real time)
//!
//! `Server` is generic over its [`Environment`]. Production binds with
//! [`Server::bind`]; tests pass a simulated clock to [`Server::bind_with_env`]
//! and step the loop with [`Server::turn`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
pub mod dispatcher;
mod error;
mod request;
pub mod signal;
pub mod sys;
mod system_env;

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc::{self, Receiver},
    },
    time::{Duration, Instant},
};

pub use config::{MAX_CONNECTIONS, ServerConfig, TIMESLOT, TriggerConfig};
pub use connection::ConnectionContext;
pub use dispatcher::{
    EventDispatcher, RegisterOptions, Registration, SIGNAL_TOKEN, TriggerMode, WAKE_TOKEN,
};
pub use error::{DispatchError, ServerError};
use mio::{
    Events, Interest, Token, Waker,
    event::Event,
    net::{TcpListener, TcpStream},
};
use reaper_core::{
    ConnectionPool, DispatchMode, DispatchState, Environment, Outcome, ThreadPool, TimerEntry,
    TimerHeap, WorkItem,
};
pub use request::{BackendSession, EchoRequest, READ_BUFFER_SIZE};
use socket2::SockRef;
pub use system_env::SystemEnv;

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX - 3);

/// Message sent to peers rejected at the connection cap.
pub const BUSY_MESSAGE: &str = "Internal server busy";

const MAX_EVENTS: usize = 10_000;

/// Remote control for a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// Ask the dispatch loop to stop after the current iteration.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            tracing::warn!("failed to wake dispatch loop: {}", e);
        }
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Reaper server over environment `E`.
pub struct Server<E = SystemEnv>
where
    E: Environment<Instant = Instant>,
{
    config: ServerConfig,
    env: E,
    listener: TcpListener,
    dispatcher: EventDispatcher,
    heap: TimerHeap<Instant, Arc<EchoRequest>>,
    connections: HashMap<Token, ConnectionContext>,
    pool: ThreadPool<EchoRequest>,
    completions: Receiver<Token>,
    live: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    next_token: usize,
}

impl Server {
    /// Bind on the system clock.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with_env(config, SystemEnv::new())
    }
}

impl<E> Server<E>
where
    E: Environment<Instant = Instant>,
{
    /// Bind the listener, start the worker pool and, if configured, install
    /// the signal bridge. Deadlines and sweeps follow `env`'s clock.
    pub fn bind_with_env(config: ServerConfig, env: E) -> Result<Self, ServerError> {
        config.validate()?;

        let address: SocketAddr = config.bind_address.parse().map_err(|e| {
            ServerError::Config(format!("invalid bind address {}: {e}", config.bind_address))
        })?;

        let mut listener = TcpListener::bind(address)?;
        let mut dispatcher = EventDispatcher::new(config.sweep_interval, env.now())?;
        dispatcher.register(
            &mut listener,
            LISTENER_TOKEN,
            RegisterOptions::readable(config.trigger.listener, false),
        )?;

        if config.handle_signals {
            signal::ignore_signal(libc::SIGPIPE)?;
            dispatcher.install_signals()?;
            dispatcher.add_signal(libc::SIGTERM, false)?;
            dispatcher.add_signal(libc::SIGINT, false)?;
            dispatcher.add_signal(libc::SIGALRM, true)?;
        }

        let sessions = (0..config.backend_connections).map(BackendSession::open).collect();
        let backend = Arc::new(ConnectionPool::new(sessions)?);

        let (notify, completions) = mpsc::channel();
        let waker = Arc::clone(dispatcher.waker());
        let pool = ThreadPool::with_completion_hook(
            config.pool.clone(),
            backend,
            move |item: &Arc<EchoRequest>| {
                if notify.send(item.token()).is_ok() {
                    if let Err(e) = waker.wake() {
                        tracing::warn!("failed to wake dispatch loop: {}", e);
                    }
                }
            },
        )?;

        Ok(Self {
            heap: TimerHeap::with_capacity(config.max_connections.min(1024)),
            config,
            env,
            listener,
            dispatcher,
            connections: HashMap::new(),
            pool,
            completions,
            live: Arc::new(AtomicUsize::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
            next_token: 0,
        })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for stopping the server from another thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: Arc::clone(&self.stop),
            live: Arc::clone(&self.live),
            waker: Arc::clone(self.dispatcher.waker()),
        }
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Run the dispatch loop until stopped by a signal or a [`ServerHandle`].
    pub fn run(mut self) -> Result<(), ServerError> {
        tracing::info!(
            mode = ?self.pool.mode(),
            workers = self.pool.worker_count(),
            trigger = ?self.config.trigger,
            "Server starting on {}",
            self.local_addr()?
        );

        let mut events = Events::with_capacity(MAX_EVENTS);
        while !self.stop.load(Ordering::Acquire) {
            self.turn(&mut events)?;
        }

        self.shutdown();
        Ok(())
    }

    /// One dispatch iteration: wait for readiness no longer than the next
    /// sweep deadline, handle every delivered event, then sweep if due.
    pub fn turn(&mut self, events: &mut Events) -> Result<(), ServerError> {
        self.dispatcher.poll(events, self.env.now())?;

        for event in &*events {
            if !self.dispatcher.accept_event(event) {
                continue;
            }
            match event.token() {
                LISTENER_TOKEN => self.accept_connections(),
                SIGNAL_TOKEN => self.handle_signals(),
                WAKE_TOKEN => self.drain_completions(),
                token => self.handle_connection_event(token, event),
            }
        }

        let now = self.env.now();
        if self.dispatcher.sweep_due(now) {
            self.sweep(now);
        }
        Ok(())
    }

    fn accept_connections(&mut self) {
        let level = self.config.trigger.listener == TriggerMode::Level;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    self.admit(stream, peer);
                    if level {
                        break;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    break;
                },
            }
        }

        if level {
            if let Err(e) =
                self.dispatcher.rearm(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
            {
                tracing::error!("failed to rearm listener: {}", e);
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.live.load(Ordering::Acquire) >= self.config.max_connections {
            tracing::warn!(%peer, "connection limit reached, rejecting");
            EventDispatcher::show_error(stream, BUSY_MESSAGE);
            return;
        }

        if self.config.linger {
            if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::from_secs(1))) {
                tracing::warn!(%peer, "failed to set SO_LINGER: {}", e);
            }
        }

        let token = self.allocate_token();
        let trigger = self.config.trigger.connection;
        let request = Arc::new(EchoRequest::new(stream, token, peer, trigger));

        let dispatcher = &mut self.dispatcher;
        let options = RegisterOptions::readable(trigger, true);
        match request.with_stream(|stream| dispatcher.register(stream, token, options)) {
            Some(Ok(_)) => {},
            Some(Err(e)) => {
                tracing::warn!(%peer, "failed to register connection: {}", e);
                request.close(self.dispatcher.registry());
                return;
            },
            None => return,
        }

        let registry = Arc::clone(self.dispatcher.registry());
        let live = Arc::clone(&self.live);
        let expire = self.env.deadline_after(self.config.idle_timeout);
        let timer = self.heap.add(TimerEntry::new(
            expire,
            Arc::clone(&request),
            move |request: Arc<EchoRequest>| {
                request.close(&registry);
                live.fetch_sub(1, Ordering::AcqRel);
            },
        ));

        self.live.fetch_add(1, Ordering::AcqRel);
        self.connections.insert(token, ConnectionContext {
            address: peer,
            token,
            request,
            timer,
            heap_position: self.heap.position(timer),
        });
        tracing::debug!(?token, %peer, live = self.live_connections(), "connection accepted");
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = (self.next_token + 1) % LISTENER_TOKEN.0;
            if !self.connections.contains_key(&token) {
                return token;
            }
        }
    }

    fn handle_connection_event(&mut self, token: Token, event: &Event) {
        let Some(context) = self.connections.get(&token) else {
            return;
        };
        let request = Arc::clone(&context.request);

        if event.is_error() || event.is_read_closed() {
            tracing::debug!(?token, "peer hung up");
            self.evict(token);
            return;
        }

        match (self.pool.mode(), event.is_readable()) {
            (DispatchMode::Reactor, readable) => {
                let state = if readable { DispatchState::Read } else { DispatchState::Write };
                self.submit(token, request, Some(state));
            },
            (DispatchMode::Proactor, true) => {
                if request.attempt_read() {
                    self.refresh(token);
                    self.submit(token, request, None);
                } else {
                    self.evict(token);
                }
            },
            (DispatchMode::Proactor, false) => {
                if request.attempt_write() {
                    self.refresh(token);
                    self.rearm(token);
                } else {
                    self.evict(token);
                }
            },
        }
    }

    fn submit(&mut self, token: Token, request: Arc<EchoRequest>, state: Option<DispatchState>) {
        let submitted = match state {
            Some(state) => self.pool.submit_with_state(request, state),
            None => self.pool.submit(request),
        };

        if let Err(e) = submitted {
            tracing::warn!(?token, "work queue rejected connection: {}", e);
            self.evict(token);
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(token) = self.completions.try_recv() {
            let Some(context) = self.connections.get(&token) else {
                continue;
            };

            match context.request.flags().take_outcome() {
                Some(Outcome::Processed) => {
                    self.refresh(token);
                    self.rearm(token);
                },
                Some(Outcome::Failed) => self.evict(token),
                None => {},
            }
        }
    }

    /// Push the connection's deadline out by the idle timeout.
    fn refresh(&mut self, token: Token) {
        let expire = self.env.deadline_after(self.config.idle_timeout);
        if let Some(context) = self.connections.get_mut(&token) {
            self.heap.adjust(context.timer, expire);
            context.heap_position = self.heap.position(context.timer);
            tracing::trace!(?token, position = ?context.heap_position, "timer refreshed");
        }
    }

    /// Re-arm a one-shot connection for its next step.
    fn rearm(&mut self, token: Token) {
        let Some(context) = self.connections.get(&token) else {
            return;
        };

        let interest =
            if context.request.wants_write() { Interest::WRITABLE } else { Interest::READABLE };
        let dispatcher = &mut self.dispatcher;
        let rearmed =
            context.request.with_stream(|stream| dispatcher.rearm(stream, token, interest));

        match rearmed {
            Some(Ok(())) => {},
            Some(Err(e)) => {
                tracing::warn!(?token, "failed to rearm connection: {}", e);
                self.evict(token);
            },
            None => self.evict(token),
        }
    }

    /// Close a connection outside a sweep.
    fn evict(&mut self, token: Token) {
        let Some(context) = self.connections.remove(&token) else {
            return;
        };
        self.dispatcher.forget(token);

        match self.heap.remove(context.timer) {
            Some(entry) => {
                entry.fire();
            },
            None => context.request.close(self.dispatcher.registry()),
        }
    }

    fn sweep(&mut self, now: Instant) {
        let report = self.dispatcher.timer_handler(&mut self.heap, now);
        if report.evicted == 0 {
            return;
        }

        let closed: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, context)| context.request.is_closed())
            .map(|(token, _)| *token)
            .collect();
        for token in closed {
            self.connections.remove(&token);
            self.dispatcher.forget(token);
        }

        tracing::info!(
            evicted = report.evicted,
            live = self.live_connections(),
            "idle connections evicted"
        );
    }

    fn handle_signals(&mut self) {
        for signal in self.dispatcher.drain_signals() {
            match signal {
                libc::SIGTERM | libc::SIGINT => {
                    tracing::info!(signal, "stop requested");
                    self.stop.store(true, Ordering::Release);
                },
                libc::SIGALRM => self.dispatcher.expire_now(self.env.now()),
                other => tracing::debug!(signal = other, "ignoring signal"),
            }
        }
    }

    fn shutdown(self) {
        let Self { pool, connections, mut heap, dispatcher, .. } = self;

        let backend = Arc::clone(pool.backend());
        let pending = pool.shutdown();
        backend.close();

        for context in connections.values() {
            context.request.close(dispatcher.registry());
        }
        heap.clear();

        tracing::info!(
            connections = connections.len(),
            pending = pending.len(),
            "Server stopped"
        );
    }
}
