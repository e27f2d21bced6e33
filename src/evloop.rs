//! Event-loop adapter.
//!
//! A thin wrapper around the OS readiness multiplexer ([`mio::Poll`],
//! epoll/kqueue underneath) with exactly the contract the scheduler needs:
//!
//! - [`register`](EvLoop::register) arms a wake for one fd in one direction;
//! - [`unregister`](EvLoop::unregister) is an idempotent cancellation;
//! - [`poll`](EvLoop::poll) dispatches every event that occurred within the
//!   given duration to a callback and returns.
//!
//! Registrations are one-shot by discipline, not by flag: the scheduler
//! deregisters an fd the moment it wakes the waiting fiber, and the waiter
//! re-registers if it has to wait again.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::coio::Direction;

bitflags::bitflags! {
    /// Readiness reported for a file descriptor.
    pub struct Readiness: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        /// Error or hangup. Delivered to the waiter regardless of the
        /// direction it asked for, so the retried operation can observe the
        /// failure itself.
        const ERROR = 0b100;
    }
}

impl Readiness {
    /// Whether this readiness wakes a waiter parked in `dir`.
    pub fn wakes(self, dir: Direction) -> bool {
        if self.contains(Self::ERROR) {
            return true;
        }
        match dir {
            Direction::Read => self.contains(Self::READABLE),
            Direction::Write => self.contains(Self::WRITABLE),
        }
    }
}

const EVENTS_CAPACITY: usize = 256;

/// Readiness-event demultiplexer handle owned by the scheduler.
pub struct EvLoop {
    poll: Poll,
    events: Events,
}

impl EvLoop {
    pub fn new() -> io::Result<Self> {
        Ok(EvLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
        })
    }

    /// Start watching `fd` for readiness in `dir`.
    ///
    /// The fd doubles as the token: the scheduler's wait index is keyed by
    /// fd and holds at most one waiter per key.
    pub fn register(&mut self, fd: RawFd, dir: Direction) -> io::Result<()> {
        let interest = match dir {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    /// Stop watching `fd`. Unregistering an fd that is not registered (or
    /// was already closed) is not an error.
    pub fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self.poll.registry().deregister(&mut SourceFd(&fd)) {
            Err(e)
                if e.raw_os_error() == Some(libc::ENOENT)
                    || e.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    /// Wait for events for at most `timeout` (`None` blocks indefinitely)
    /// and report each as `(fd, readiness)`.
    ///
    /// Interruption by signal delivery is a clean, eventless wake.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        mut on_event: impl FnMut(RawFd, Readiness),
    ) -> io::Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }
        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let mut readiness = Readiness::empty();
            if event.is_readable() {
                readiness |= Readiness::READABLE;
            }
            if event.is_writable() {
                readiness |= Readiness::WRITABLE;
            }
            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                readiness |= Readiness::ERROR;
            }
            on_event(fd, readiness);
        }
        Ok(())
    }

    /// Replace the underlying poller with a fresh one.
    ///
    /// An epoll instance inherited across `fork` is shared with the parent
    /// process; a child that kept it would race the parent for readiness
    /// events. The caller re-registers every fd it still waits on.
    pub fn rebuild(&mut self) -> io::Result<()> {
        self.poll = Poll::new()?;
        self.events.clear();
        Ok(())
    }
}
