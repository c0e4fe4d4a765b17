//! Readiness multiplexing over raw descriptors with `poll(2)`.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::PollFlags;

use crate::error::{Result, SubprocError};

/// A set of descriptors that can be waited on for readiness.
///
/// Implemented by [`Poller`]; the I/O pump is generic over it so its state
/// machine can be driven by a scripted source in tests.
pub trait Readiness {
    /// Register interest in `fd`. Registering a descriptor again merges the
    /// new interest into the existing one.
    fn add(&mut self, fd: RawFd, interest: PollFlags) -> Result<()>;

    /// Stop watching `fd`. With `must_exist`, an unknown descriptor is an error.
    fn remove(&mut self, fd: RawFd, must_exist: bool) -> Result<()>;

    /// Block until a watched descriptor is ready or `timeout` elapses. Returns
    /// the ready descriptors with the conditions observed; empty on timeout.
    fn poll(&mut self, timeout: Duration) -> Result<HashMap<RawFd, PollFlags>>;

    fn is_empty(&self) -> bool;
}

/// `poll(2)`-backed [`Readiness`] set, kept sorted by descriptor.
#[derive(Default)]
pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.fds
                    .iter()
                    .map(|pfd| (pfd.fd, PollFlags::from_bits_truncate(pfd.events))),
            )
            .finish()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn interest(&self, fd: RawFd) -> Option<PollFlags> {
        self.position(fd)
            .ok()
            .and_then(|i| self.fds.get(i))
            .map(|pfd| PollFlags::from_bits_truncate(pfd.events))
    }

    fn position(&self, fd: RawFd) -> std::result::Result<usize, usize> {
        self.fds.binary_search_by_key(&fd, |pfd| pfd.fd)
    }
}

impl Readiness for Poller {
    fn add(&mut self, fd: RawFd, interest: PollFlags) -> Result<()> {
        if fd < 0 || interest.is_empty() {
            return Err(SubprocError::InvalidDescriptor(fd));
        }
        match self.position(fd) {
            Ok(i) => {
                if let Some(pfd) = self.fds.get_mut(i) {
                    pfd.events |= interest.bits();
                }
            }
            Err(i) => self.fds.insert(
                i,
                libc::pollfd {
                    fd,
                    events: interest.bits(),
                    revents: 0,
                },
            ),
        }
        Ok(())
    }

    fn remove(&mut self, fd: RawFd, must_exist: bool) -> Result<()> {
        match self.position(fd) {
            Ok(i) => {
                self.fds.remove(i);
                Ok(())
            }
            Err(_) if must_exist => Err(SubprocError::NotRegistered(fd)),
            Err(_) => Ok(()),
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<HashMap<RawFd, PollFlags>> {
        // `None` when the timeout reaches past what `Instant` can represent;
        // such a wait is unbounded.
        let deadline = Instant::now().checked_add(timeout);
        let mut remaining = timeout;
        loop {
            let millis = match deadline {
                // Round up so sub-millisecond waits do not degrade into a busy loop.
                Some(_) => libc::c_int::try_from(remaining.as_micros().div_ceil(1000))
                    .unwrap_or(libc::c_int::MAX),
                None => -1,
            };
            // SAFETY: the pointer and length describe `self.fds`, which stays
            // alive and unaliased for the duration of the call.
            let ret = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    millis,
                )
            };
            if ret >= 0 {
                break;
            }
            match Errno::last() {
                Errno::EINTR => {
                    if let Some(deadline) = deadline {
                        remaining = deadline.saturating_duration_since(Instant::now());
                    }
                }
                errno => return Err(SubprocError::PollFailed(errno)),
            }
        }

        Ok(self
            .fds
            .iter()
            .filter(|pfd| pfd.revents != 0)
            .map(|pfd| (pfd.fd, PollFlags::from_bits_truncate(pfd.revents)))
            .collect())
    }

    fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}
