//! File-status flag helpers over `fcntl`.

#![allow(unsafe_code)]

use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd},
};

/// File-status flags of a descriptor as returned by `F_GETFL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatusFlags(i32);

impl FileStatusFlags {
    /// Raw flag bits.
    pub fn bits(self) -> i32 {
        self.0
    }

    /// Whether `O_NONBLOCK` is set.
    pub fn is_nonblocking(self) -> bool {
        self.0 & libc::O_NONBLOCK != 0
    }
}

/// Read the descriptor's file-status flags.
pub fn status_flags(fd: BorrowedFd<'_>) -> io::Result<FileStatusFlags> {
    // SAFETY: `fd` is a live descriptor for the duration of the borrow and
    // F_GETFL takes no pointer arguments.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(FileStatusFlags(flags))
}

/// Put the descriptor in non-blocking mode, returning the flags it had before.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<FileStatusFlags> {
    let previous = status_flags(fd)?;
    if previous.is_nonblocking() {
        return Ok(previous);
    }

    // SAFETY: as above; F_SETFL takes an integer flag argument.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, previous.0 | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, os::fd::AsFd};

    use super::*;

    #[test]
    fn set_nonblocking_reports_previous_flags() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let before = set_nonblocking(listener.as_fd()).unwrap();
        assert!(!before.is_nonblocking());
        assert!(status_flags(listener.as_fd()).unwrap().is_nonblocking());

        let again = set_nonblocking(listener.as_fd()).unwrap();
        assert!(again.is_nonblocking());
        assert_eq!(again.bits() & !libc::O_NONBLOCK, before.bits());
    }
}
