//! Advisory file locking.
//!
//! The exclusion primitive behind the listener fan-out: a lock file held by
//! at most one process of the acceptor pool at a time, so that only one
//! process blocks in `accept` on the shared listening socket.
//!
//! The lock is advisory (`flock(2)`): it excludes only peers that also ask
//! for it, which is exactly the pool's contract. The OS releases it
//! automatically when the holding process exits, so a crashed worker never
//! wedges its peers.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::Result;

/// An exclusive advisory lock on a file.
///
/// Dropping the value closes the file, which releases the lock if held.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Open (creating if necessary) the lock file at `path`.
    ///
    /// Opening does not acquire the lock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)?;
        Ok(FileLock { file })
    }

    /// Try to take the exclusive lock without blocking.
    ///
    /// Returns `Ok(false)` when another process holds it.
    pub fn try_lock(&self) -> Result<bool> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(false),
            _ => Err(err.into()),
        }
    }

    /// Release the lock. Releasing a lock that is not held is a no-op.
    pub fn unlock(&self) -> Result<()> {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}
