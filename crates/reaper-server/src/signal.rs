//! Self-pipe bridge from OS signals to the dispatch loop.
//!
//! The handler writes the signal number as one byte into the non-blocking
//! write end of a pipe and restores `errno`. The read end is polled like any
//! other descriptor, so signals are handled on the dispatch thread.
//!
//! A signal handler receives no context argument, so the write descriptor is
//! published through a process-wide atomic. It is set when a [`SignalPipe`] is
//! installed and cleared when it is dropped; at most one pipe exists at a time.

#![allow(unsafe_code)]

use std::{
    io::{self, Read},
    mem,
    os::fd::AsRawFd,
    ptr,
    sync::atomic::{AtomicI32, Ordering},
};

use mio::unix::pipe::{self, Receiver, Sender};

use crate::error::DispatchError;

/// Write end of the installed pipe, or -1.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Async-signal-safe handler: forward the signal number, preserve `errno`.
extern "C" fn forward_signal(signal: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    // SAFETY: errno_location returns the calling thread's errno slot; `write`
    // is async-signal-safe and the buffer outlives the call.
    unsafe {
        let errno = errno_location();
        let saved = *errno;
        let byte = signal as u8;
        libc::write(fd, ptr::from_ref(&byte).cast::<libc::c_void>(), 1);
        *errno = saved;
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    // SAFETY: always valid on the calling thread.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    // SAFETY: always valid on the calling thread.
    unsafe { libc::__error() }
}

/// Installed signal pipe.
#[derive(Debug)]
pub struct SignalPipe {
    sender: Sender,
    receiver: Receiver,
    handled: Vec<libc::c_int>,
}

impl SignalPipe {
    /// Create the pipe and publish its write end to the handler.
    ///
    /// # Errors
    ///
    /// - `DispatchError::SignalsInstalled` if another pipe is live
    /// - `DispatchError::Io` if the pipe cannot be created
    pub fn install() -> Result<Self, DispatchError> {
        let (sender, receiver) = pipe::new()?;
        SIGNAL_WRITE_FD
            .compare_exchange(-1, sender.as_raw_fd(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DispatchError::SignalsInstalled)?;

        Ok(Self { sender, receiver, handled: Vec::new() })
    }

    /// Read end, for registration with the poll.
    pub fn receiver_mut(&mut self) -> &mut Receiver {
        &mut self.receiver
    }

    /// Route `signal` through the pipe.
    ///
    /// With `restart`, system calls interrupted by the signal are restarted.
    /// Every signal is blocked while the handler runs.
    pub fn add(&mut self, signal: libc::c_int, restart: bool) -> Result<(), DispatchError> {
        // SAFETY: `action` is fully initialised before use and the handler
        // only performs async-signal-safe operations.
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            let handler: extern "C" fn(libc::c_int) = forward_signal;
            action.sa_sigaction = handler as libc::sighandler_t;
            if restart {
                action.sa_flags |= libc::SA_RESTART;
            }
            libc::sigfillset(&raw mut action.sa_mask);

            if libc::sigaction(signal, &raw const action, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        if !self.handled.contains(&signal) {
            self.handled.push(signal);
        }
        tracing::debug!(signal, restart, "signal routed to dispatch loop");
        Ok(())
    }

    /// Decode every pending signal number.
    pub fn drain(&mut self) -> Vec<libc::c_int> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.receiver.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => signals.extend(buf[..n].iter().map(|&b| libc::c_int::from(b))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("signal pipe read failed: {}", e);
                    break;
                },
            }
        }
        signals
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for &signal in &self.handled {
            // SAFETY: restoring the default disposition has no preconditions.
            unsafe {
                libc::signal(signal, libc::SIG_DFL);
            }
        }
        let _ = SIGNAL_WRITE_FD.compare_exchange(
            self.sender.as_raw_fd(),
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Ignore `signal` for the whole process (e.g. `SIGPIPE`).
pub fn ignore_signal(signal: libc::c_int) -> Result<(), DispatchError> {
    // SAFETY: SIG_IGN is always a valid disposition.
    let previous = unsafe { libc::signal(signal, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_signal_arrives_through_pipe() {
        let mut pipe = SignalPipe::install().unwrap();
        assert!(matches!(SignalPipe::install(), Err(DispatchError::SignalsInstalled)));

        pipe.add(libc::SIGUSR2, true).unwrap();
        // SAFETY: raising a signal we installed a handler for.
        assert_eq!(unsafe { libc::raise(libc::SIGUSR2) }, 0);

        assert_eq!(pipe.drain(), vec![libc::SIGUSR2]);
        assert!(pipe.drain().is_empty());

        drop(pipe);
        let pipe = SignalPipe::install();
        assert!(pipe.is_ok(), "dropping the pipe releases the slot");
    }
}
