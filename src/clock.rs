//! The `clock` module returns time values derived from the Posix / C
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! function.
//!
//! Functions returning a number of seconds have names followed by “64”
//! variants returning a 64-bit number of nanoseconds.
//!
//! - [time()](fn.time.html) - Get the wall clock time in seconds
//! - [time64()](fn.time64.html) - Get the wall clock time in nanoseconds
//! - [monotonic()](fn.monotonic.html) - Get the monotonic time in seconds
//! - [monotonic64()](fn.monotonic64.html) - Get the monotonic time in nanoseconds
//!
//! The scheduler timestamps its loop iterations and orders every sleep and
//! I/O-wait deadline on the monotonic clock.

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[inline]
fn gettime(id: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime cannot fail for the clock ids used here.
    unsafe { libc::clock_gettime(id, &mut ts) };
    ts
}

#[inline]
fn as_nanos(ts: libc::timespec) -> u64 {
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// The wall clock time in seconds.
///
/// Derived from `clock_gettime(CLOCK_REALTIME)`. This is the best function
/// for knowing what the official time is, as determined by the system
/// administrator. It is subject to step adjustments; never use it to order
/// deadlines.
#[inline(always)]
pub fn time() -> f64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / NANOS_PER_SEC as f64
}

/// The wall clock time in nanoseconds since epoch.
///
/// See: [time()](fn.time.html)
#[inline(always)]
pub fn time64() -> u64 {
    as_nanos(gettime(libc::CLOCK_REALTIME))
}

/// The monotonic time in seconds.
///
/// Derived from `clock_gettime(CLOCK_MONOTONIC)`. Monotonic time is not
/// affected by clock steps or daylight saving time. This is the best
/// function to use for measuring elapsed time.
#[inline(always)]
pub fn monotonic() -> f64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / NANOS_PER_SEC as f64
}

/// The monotonic time in nanoseconds since boot.
///
/// See: [monotonic()](fn.monotonic.html)
#[inline(always)]
pub fn monotonic64() -> u64 {
    as_nanos(gettime(libc::CLOCK_MONOTONIC))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_non_decreasing() {
        let a = monotonic64();
        let b = monotonic64();
        assert!(b >= a);
    }

    #[test]
    fn seconds_track_nanos() {
        let secs = monotonic();
        let nanos = monotonic64();
        assert!((nanos as f64 / 1e9 - secs).abs() < 1.0);
    }
}
