//! Listener fan-out: a pool of acceptor processes sharing one listening
//! socket, serialized by an advisory file lock.
//!
//! [`listen_and_accept`] binds the socket, forks the pool, and runs the
//! scheduler. Each process loops: try the lock (sleeping 500 ms and
//! retrying while a peer holds it), then `accept`, release the lock, and
//! spawn a per-connection fiber built by the caller's factory. The lock
//! keeps all but one process out of `accept`, which avoids the
//! thundering-herd wake on the shared listening descriptor.
//!
//! Fork the pool before spawning other fibers: whatever fibers exist at
//! fork time are duplicated into every worker process.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, error, warn};

use crate::coio::{CoListener, CoStream};
use crate::error::{Error, Result};
use crate::fiber;
use crate::flock::FileLock;
use crate::sched;

/// Number of acceptor processes (the pre-fork master included) spawned when
/// the caller does not choose one.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// How long a process backs off when a peer holds the accept lock.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Prefix of the lock-file path; the master pid is appended so concurrent
/// servers do not contend on each other's lock.
const LOCK_PREFIX: &str = "/tmp/fibrio_lf_";

/// Serve TCP connections on `addr` with a pool of `workers` acceptor
/// processes.
///
/// For every accepted connection, `factory` builds the work to run in a
/// fresh fiber; the connection is handed over as an owning [`CoStream`], so
/// it is closed however that fiber exits. On the happy path this function
/// never returns: the acceptor loop runs until the process exits.
///
/// `workers` of 0 or 1 keeps a single process. A failed `fork` is logged
/// and the pool degrades to the processes already running.
pub fn listen_and_accept<F, W>(addr: SocketAddrV4, workers: usize, factory: F) -> Result<()>
where
    F: FnMut(CoStream, SocketAddr) -> W + 'static,
    W: FnOnce() -> i32 + 'static,
{
    fiber::Builder::new()
        .name("listener")
        .spawn(move || acceptor_work(addr, workers, factory))?;
    sched::schedule()
}

/// The acceptor fiber body: bind, fork the pool, race for the lock, accept.
fn acceptor_work<F, W>(addr: SocketAddrV4, workers: usize, mut factory: F) -> i32
where
    F: FnMut(CoStream, SocketAddr) -> W + 'static,
    W: FnOnce() -> i32 + 'static,
{
    let listener = match CoListener::bind(&SocketAddr::V4(addr)) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot listen on {}: {}", addr, e);
            return -1;
        }
    };

    // The lock path is derived from the pid of the process that owned the
    // socket before the pool existed.
    let master_pid = unsafe { libc::getpid() };

    for spawned in 1..workers.max(1) {
        match unsafe { libc::fork() } {
            0 => {
                // Children accept too, but never fork further. The epoll
                // instance inherited from the master must be replaced.
                if let Err(e) = sched::reinit_after_fork() {
                    error!("cannot rebuild the event loop after fork: {}", e);
                    return -1;
                }
                break;
            }
            -1 => {
                let e = Error::Fork(io::Error::last_os_error());
                warn!("{}; continuing with {} acceptor process(es)", e, spawned);
                break;
            }
            pid => debug!("spawned acceptor process {}", pid),
        }
    }

    let lock_path = format!("{}{}", LOCK_PREFIX, master_pid);
    let lock = match FileLock::open(&lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            error!("cannot open lock file {}: {}", lock_path, e);
            return -1;
        }
    };

    loop {
        match lock.try_lock() {
            Ok(true) => {}
            // A peer is in accept; yield the role for a while.
            _ => {
                fiber::sleep(LOCK_RETRY_DELAY);
                continue;
            }
        }

        match listener.accept(None) {
            Ok((stream, peer)) => {
                if let Err(e) = lock.unlock() {
                    warn!("unlock failed: {}", e);
                }
                let name = format!("conn/{}", peer);
                let work = factory(stream, peer);
                if let Err(e) = fiber::Builder::new().name(name).spawn(work) {
                    error!("cannot spawn connection fiber: {}", e);
                }
            }
            Err(e) => {
                // Release before retrying so a healthy peer can take over.
                if let Err(e) = lock.unlock() {
                    warn!("unlock failed: {}", e);
                }
                warn!("accept on {} failed: {}", addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coio::FrameCheck;
    use crate::coio::IsComplete;

    #[test]
    fn pool_constants_match_the_intended_topology() {
        // One master plus three forked children.
        assert_eq!(DEFAULT_POOL_SIZE, 4);
        assert_eq!(LOCK_RETRY_DELAY, Duration::from_millis(500));
    }

    #[test]
    fn factory_closures_satisfy_the_bounds() {
        // Compile-time check that an ordinary closure pair is accepted.
        fn assert_factory<F, W>(_: F)
        where
            F: FnMut(CoStream, SocketAddr) -> W + 'static,
            W: FnOnce() -> i32 + 'static,
        {
        }
        assert_factory(|stream: CoStream, _peer| move || {
            drop(stream);
            0
        });
        // And that framing predicates compose with connection works.
        let check = |buf: &[u8]| {
            if buf.is_empty() {
                FrameCheck::Partial
            } else {
                FrameCheck::Complete(buf.len())
            }
        };
        assert_eq!(check.check_frame(b"x"), FrameCheck::Complete(1));
    }
}
