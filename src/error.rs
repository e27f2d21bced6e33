//! Error handling utils.
//!
//! Every fallible routine of the crate returns [`Error`] through the
//! crate-wide [`Result`] alias. Failures are plain values: the runtime never
//! unwinds across a fiber's yield boundary, so whatever a blocking-shaped
//! primitive hits (timeout, peer close, system error) comes back as the
//! return value of that very call.
//!
//! Two classes of I/O outcomes are handled internally and never reach the
//! caller: "would block" (converted into a suspension) and "interrupted"
//! (retried on the spot).

use std::io;
use std::os::unix::io::RawFd;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An I/O wait expired before the file descriptor became ready.
    ///
    /// The descriptor is left open and still usable.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection before a complete reply was received.
    ///
    /// Plain [`recv`](crate::coio::recv) reports an orderly shutdown as
    /// `Ok(0)`; this error is produced by composite operations for which a
    /// zero-length read means the reply can never complete.
    #[error("connection closed by peer")]
    PeerClosed,

    /// Another fiber is already waiting on this file descriptor.
    ///
    /// At most one fiber may be suspended on a given fd at a time. Hitting
    /// this is a programming error in the calling code; the offending fiber
    /// gets the failure, the scheduler and the registered waiter continue
    /// unaffected.
    #[error("another fiber is already waiting on fd {0}")]
    FdBusy(RawFd),

    /// The framing predicate rejected the accumulated reply bytes.
    #[error("malformed reply")]
    Malformed,

    /// A suspending primitive was called outside of a fiber.
    #[error("cannot block outside of a fiber")]
    OutsideFiber,

    /// A scheduler lifecycle operation was called from inside a fiber.
    #[error("operation is not allowed from inside a fiber")]
    InsideFiber,

    /// The current thread has no initialized runtime.
    #[error("runtime is not initialized on this thread")]
    Uninitialized,

    #[error("runtime is already initialized on this thread")]
    AlreadyInitialized,

    /// Spawning an acceptor process failed.
    #[error("fork failed: {0}")]
    Fork(io::Error),
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(e) => e,
            Error::Timeout => io::ErrorKind::TimedOut.into(),
            Error::PeerClosed => io::ErrorKind::ConnectionAborted.into(),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_round_trip() {
        let e = Error::from(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        let io: io::Error = e.into();
        assert_eq!(io.raw_os_error(), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn timeout_maps_to_timed_out() {
        let io: io::Error = Error::Timeout.into();
        assert_eq!(io.kind(), io::ErrorKind::TimedOut);
    }
}
