//! Cooperative fiber runtime for network I/O servers.
//!
//! `fibrio` multiplexes many logical threads of execution ("fibers") onto a
//! single OS thread. Each fiber writes straight-line blocking-style code
//! (accept, recv, send, sleep) and the runtime turns every blocking point
//! into a non-blocking operation registered with a readiness event loop,
//! switching to another fiber until the event arrives.
//!
//! This library contains the following modules:
//!
//! - [Fibers: spawning, sleeping, context-switch tracking](fiber)
//! - [Cooperative I/O: sockets that park the fiber instead of the thread](coio)
//! - [The scheduler and runtime lifecycle](sched)
//! - [Event-loop adapter over the OS readiness multiplexer](evloop)
//! - [Listener fan-out across a pool of acceptor processes](listen)
//! - [Advisory file locking](flock)
//! - [Clock utilities](clock)
//! - [Error handling](error)
//!
//! Scheduling is strictly cooperative and single-threaded per process: no
//! preemption, no fiber migration across threads, strict FIFO among
//! runnable fibers. Parallelism comes from forking whole processes, each
//! with its own scheduler (see [`listen_and_accept`]).
//!
//! ### Example
//!
//! ```no_run
//! use fibrio::coio::CoStream;
//!
//! fn echo(mut stream: CoStream) -> i32 {
//!     let mut buf = [0u8; 512];
//!     loop {
//!         match stream.read_with_timeout(&mut buf, None) {
//!             Ok(0) => return 0, // peer closed
//!             Ok(n) => {
//!                 if stream.write_all_with_timeout(&buf[..n], None).is_err() {
//!                     return -1;
//!                 }
//!             }
//!             Err(_) => return -1,
//!         }
//!     }
//! }
//!
//! fn main() -> fibrio::Result<()> {
//!     fibrio::init()?;
//!     fibrio::listen_and_accept(
//!         "127.0.0.1:8080".parse().unwrap(),
//!         fibrio::listen::DEFAULT_POOL_SIZE,
//!         |stream, _peer| move || echo(stream),
//!     )
//! }
//! ```

pub mod clock;
pub mod coio;
pub mod error;
pub mod evloop;
pub mod fiber;
pub mod flock;
pub mod listen;
pub mod sched;

pub use error::{Error, Result};
pub use fiber::{sleep, spawn};
pub use listen::listen_and_accept;
pub use sched::{fini, init, schedule};
