//! Event dispatch over `mio`.
//!
//! [`EventDispatcher`] owns the poll instance, the signal pipe and the sweep
//! schedule, and tracks every registered descriptor.
//!
//! # Trigger modes
//!
//! `mio` only offers edge-triggered readiness. The dispatcher layers the other
//! behaviors on top:
//!
//! - **one-shot**: after one delivered event the registration is disarmed and
//!   further events are dropped until [`EventDispatcher::rearm`].
//! - **level**: the owner re-arms after every dispatch step. Re-registering
//!   re-evaluates readiness, so unread data is reported again.

use std::{
    collections::HashMap,
    io::{self, Write},
    os::fd::AsFd,
    sync::Arc,
    time::{Duration, Instant},
};

use mio::{
    Events, Interest, Poll, Registry, Token, Waker,
    event::{Event, Source},
};
use reaper_core::{SweepReport, SweepSchedule, TimerHeap};

use crate::{
    error::DispatchError,
    signal::SignalPipe,
    sys::{self, FileStatusFlags},
};

/// Token of the signal pipe's read end.
pub const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

/// Token of the cross-thread waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX - 2);

/// How readiness is reported for a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerMode {
    /// Reported while the condition holds; handlers process one step at a time
    #[default]
    Level,
    /// Reported on transitions; handlers drain until `WouldBlock`
    Edge,
}

/// Registration parameters.
#[derive(Debug, Clone, Copy)]
pub struct RegisterOptions {
    /// Readiness reporting mode
    pub trigger: TriggerMode,
    /// Disarm after one event until re-armed
    pub one_shot: bool,
    /// Events of interest
    pub interest: Interest,
}

impl RegisterOptions {
    /// Readable interest with the given trigger mode.
    pub fn readable(trigger: TriggerMode, one_shot: bool) -> Self {
        Self { trigger, one_shot, interest: Interest::READABLE }
    }
}

/// Record of a registered descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    /// Token events are reported under
    pub token: Token,
    /// Options it was registered with; `interest` tracks the latest rearm
    pub options: RegisterOptions,
    /// File-status flags before the descriptor was made non-blocking
    pub previous_flags: FileStatusFlags,
    armed: bool,
}

impl Registration {
    /// Whether events for this descriptor are currently delivered.
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

/// Readiness multiplexer with signal bridging and a periodic sweep trigger.
#[derive(Debug)]
pub struct EventDispatcher {
    poll: Poll,
    registry: Arc<Registry>,
    waker: Arc<Waker>,
    signals: Option<SignalPipe>,
    schedule: SweepSchedule<Instant>,
    registrations: HashMap<Token, Registration>,
}

impl EventDispatcher {
    /// Create a dispatcher whose first sweep is due `interval` after `now`.
    pub fn new(interval: Duration, now: Instant) -> Result<Self, DispatchError> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        Ok(Self {
            poll,
            registry,
            waker,
            signals: None,
            schedule: SweepSchedule::new(interval, now),
            registrations: HashMap::new(),
        })
    }

    /// Registry handle usable from eviction callbacks.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Waker for worker threads; events arrive under [`WAKE_TOKEN`].
    pub fn waker(&self) -> &Arc<Waker> {
        &self.waker
    }

    /// Make `source` non-blocking and start watching it.
    pub fn register<S>(
        &mut self,
        source: &mut S,
        token: Token,
        options: RegisterOptions,
    ) -> Result<Registration, DispatchError>
    where
        S: Source + AsFd,
    {
        let previous_flags = sys::set_nonblocking(source.as_fd())
            .map_err(|source| DispatchError::Register { token, source })?;
        self.registry
            .register(source, token, options.interest)
            .map_err(|source| DispatchError::Register { token, source })?;

        let registration = Registration { token, options, previous_flags, armed: true };
        self.registrations.insert(token, registration);
        tracing::trace!(
            ?token,
            trigger = ?options.trigger,
            one_shot = options.one_shot,
            "registered"
        );
        Ok(registration)
    }

    /// Re-arm a registration, optionally with new interest.
    ///
    /// Re-registering makes the OS re-check readiness, which is what turns
    /// edge notification into level behavior.
    pub fn rearm<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), DispatchError>
    where
        S: Source + ?Sized,
    {
        let registration =
            self.registrations.get_mut(&token).ok_or(DispatchError::UnknownToken(token))?;
        self.registry.reregister(source, token, interest)?;
        registration.options.interest = interest;
        registration.armed = true;
        Ok(())
    }

    /// Stop watching `source`.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> Result<(), DispatchError>
    where
        S: Source + ?Sized,
    {
        self.registrations.remove(&token).ok_or(DispatchError::UnknownToken(token))?;
        self.registry.deregister(source)?;
        Ok(())
    }

    /// Drop bookkeeping for a descriptor that was deregistered elsewhere.
    pub fn forget(&mut self, token: Token) -> Option<Registration> {
        self.registrations.remove(&token)
    }

    /// Registration for `token`.
    pub fn registration(&self, token: Token) -> Option<&Registration> {
        self.registrations.get(&token)
    }

    /// Number of tracked registrations.
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }

    /// Create the signal pipe and start polling it under [`SIGNAL_TOKEN`].
    pub fn install_signals(&mut self) -> Result<(), DispatchError> {
        let mut pipe = SignalPipe::install()?;
        self.registry.register(pipe.receiver_mut(), SIGNAL_TOKEN, Interest::READABLE)?;
        self.signals = Some(pipe);
        Ok(())
    }

    /// Route `signal` to the dispatch loop.
    pub fn add_signal(&mut self, signal: libc::c_int, restart: bool) -> Result<(), DispatchError> {
        self.signals.as_mut().ok_or(DispatchError::SignalsNotInstalled)?.add(signal, restart)
    }

    /// Signals received since the last call.
    pub fn drain_signals(&mut self) -> Vec<libc::c_int> {
        self.signals.as_mut().map(SignalPipe::drain).unwrap_or_default()
    }

    /// Wait for readiness, at most until the next sweep is due.
    ///
    /// An interrupted wait returns `Ok` with no events.
    pub fn poll(&mut self, events: &mut Events, now: Instant) -> Result<(), DispatchError> {
        let timeout = self.schedule.remaining(now);
        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one-shot filtering to a delivered event.
    ///
    /// Returns `false` if the event must be ignored. Events for unknown tokens
    /// (signal pipe, waker) always pass.
    pub fn accept_event(&mut self, event: &Event) -> bool {
        let Some(registration) = self.registrations.get_mut(&event.token()) else {
            return true;
        };
        if !registration.armed {
            return false;
        }
        if registration.options.one_shot {
            registration.armed = false;
        }
        true
    }

    /// Whether the periodic sweep is due.
    pub fn sweep_due(&self, now: Instant) -> bool {
        self.schedule.is_due(now)
    }

    /// Force the next sweep to run on the next loop iteration.
    pub fn expire_now(&mut self, now: Instant) {
        self.schedule.expire_now(now);
    }

    /// Sweep expired entries and rearm the interval.
    pub fn timer_handler<D>(
        &mut self,
        heap: &mut TimerHeap<Instant, D>,
        now: Instant,
    ) -> SweepReport {
        let report = heap.sweep(now);
        self.schedule.rearm(now);

        if report.popped() > 0 {
            tracing::debug!(
                evicted = report.evicted,
                discarded = report.discarded,
                remaining = heap.len(),
                "timer sweep"
            );
        }
        report
    }

    /// Best-effort error message to a peer, then close it.
    ///
    /// One write attempt; failures are logged, never returned. The stream is
    /// closed when it goes out of scope here.
    pub fn show_error<W: Write>(mut stream: W, info: &str) {
        if let Err(e) = stream.write_all(info.as_bytes()).and_then(|()| stream.flush()) {
            tracing::debug!("failed to deliver error message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use mio::net::{TcpListener, TcpStream};

    use super::*;

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    fn poll_for(dispatcher: &mut EventDispatcher, events: &mut Events, token: Token) -> bool {
        for _ in 0..50 {
            dispatcher.poll.poll(events, Some(Duration::from_millis(10))).unwrap();
            for event in events.iter() {
                if event.token() == token && dispatcher.accept_event(event) {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn one_shot_disarms_until_rearm() {
        let mut dispatcher = EventDispatcher::new(Duration::from_secs(5), Instant::now()).unwrap();
        let mut events = Events::with_capacity(16);
        let (mut server, mut client) = connected_pair();
        let token = Token(1);

        let registration = dispatcher
            .register(&mut server, token, RegisterOptions::readable(TriggerMode::Level, true))
            .unwrap();
        assert!(registration.previous_flags.is_nonblocking(), "mio sockets start non-blocking");

        client.write_all(b"ping").unwrap();
        assert!(poll_for(&mut dispatcher, &mut events, token));
        assert!(!dispatcher.registration(token).unwrap().is_armed());

        // Data is still unread; nothing is delivered while disarmed.
        client.write_all(b"more").unwrap();
        assert!(!poll_for(&mut dispatcher, &mut events, token));

        dispatcher.rearm(&mut server, token, Interest::READABLE).unwrap();
        assert!(poll_for(&mut dispatcher, &mut events, token), "rearm reports pending data");

        dispatcher.deregister(&mut server, token).unwrap();
        assert!(dispatcher.registration(token).is_none());
        assert!(matches!(
            dispatcher.rearm(&mut server, token, Interest::READABLE),
            Err(DispatchError::UnknownToken(_))
        ));
    }

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn register_makes_blocking_socket_nonblocking() {
        let mut dispatcher = EventDispatcher::new(Duration::from_secs(5), Instant::now()).unwrap();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut listener = TcpListener::from_std(std_listener);

        let registration = dispatcher
            .register(&mut listener, Token(9), RegisterOptions::readable(TriggerMode::Edge, false))
            .unwrap();
        assert!(!registration.previous_flags.is_nonblocking());
        assert_eq!(dispatcher.registered(), 1);
    }

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn timer_handler_sweeps_and_rearms() {
        let start = Instant::now();
        let mut dispatcher = EventDispatcher::new(Duration::from_secs(5), start).unwrap();
        let mut heap = TimerHeap::new();
        heap.add(reaper_core::TimerEntry::new(start + Duration::from_secs(1), (), |()| {}));
        heap.add(reaper_core::TimerEntry::new(start + Duration::from_secs(30), (), |()| {}));

        let later = start + Duration::from_secs(6);
        assert!(dispatcher.sweep_due(later));

        let report = dispatcher.timer_handler(&mut heap, later);
        assert_eq!(report.evicted, 1);
        assert_eq!(heap.len(), 1);
        assert!(!dispatcher.sweep_due(later));

        dispatcher.expire_now(later);
        assert!(dispatcher.sweep_due(later));
    }

    #[test]
    fn show_error_sends_message_and_closes() {
        let (server, mut client) = connected_pair();
        EventDispatcher::show_error(server, "Internal server busy");

        let mut received = String::new();
        client.read_to_string(&mut received).unwrap();
        assert_eq!(received, "Internal server busy");
    }

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn signals_require_installed_bridge() {
        let mut dispatcher = EventDispatcher::new(Duration::from_secs(5), Instant::now()).unwrap();
        assert!(matches!(
            dispatcher.add_signal(libc::SIGUSR1, true),
            Err(DispatchError::SignalsNotInstalled)
        ));
        assert!(dispatcher.drain_signals().is_empty());
    }
}
