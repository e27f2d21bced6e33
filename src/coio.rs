//! Cooperative input/output.
//!
//! Blocking-shaped wrappers around non-blocking socket calls. Each
//! primitive attempts its system call once; if the call would block, the
//! calling fiber is parked in the scheduler's I/O wait index and the thread
//! moves on to other fibers. The fiber resumes when the descriptor becomes
//! ready (or its timeout expires) and retries. Callers never observe
//! "would block", and "interrupted" is retried on the spot.
//!
//! At most one fiber may wait on a given file descriptor at a time;
//! violating this fails the offending call with [`Error::FdBusy`] without
//! suspending it.
//!
//! On top of the primitives sit owning wrappers ([`CoStream`],
//! [`CoListener`], [`CoDgram`]) whose `Drop` closes the descriptor, so a
//! fiber that returns early (or unwinds) releases its sockets on every
//! exit path, and the request/reply composites [`udp_send_and_recv`] and
//! [`tcp_send_and_recv`].

use std::io::{self, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::raw::c_void;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use log::debug;

use crate::clock;
use crate::error::{Error, Result};
use crate::fiber::{self, Wait, Wake};
use crate::sched;

/// Which readiness a waiter is parked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Listen backlog used by [`CoListener::bind`].
pub const DEFAULT_BACKLOG: libc::c_int = 5;

/// Largest datagram [`udp_send_and_recv`] will accept.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Initial reply-buffer size of [`tcp_send_and_recv`]; the buffer doubles
/// whenever a read fills it to the brim.
const INITIAL_REPLY_BUF: usize = 512;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

////////////////////////////////////////////////////////////////////////////////
// Waiting
////////////////////////////////////////////////////////////////////////////////

/// Park the calling fiber until `fd` is ready in `dir`. Yields.
///
/// - `fd` - non-blocking socket file descriptor
/// - `dir` - requested readiness
/// - `timeout` - optional bound on the wait; expiry resumes the fiber with
///   [`Error::Timeout`] and leaves the descriptor untouched
pub fn wait(fd: RawFd, dir: Direction, timeout: Option<Duration>) -> Result<()> {
    sched::io_wait_register(fd, dir, timeout)?;
    match fiber::suspend(Wait::Io { fd, dir, timeout })? {
        Wake::Ready => Ok(()),
        Wake::Timeout => Err(Error::Timeout),
    }
}

/// Absolute deadline shared by every suspension of one logical operation,
/// so that an operation which waits more than once still honors the
/// timeout the caller gave it.
#[derive(Debug, Clone, Copy)]
struct OpDeadline(Option<u64>);

impl OpDeadline {
    fn new(timeout: Option<Duration>) -> Self {
        OpDeadline(timeout.map(|t| clock::monotonic64().saturating_add(nanos(t))))
    }

    /// Time left, or [`Error::Timeout`] if the deadline has passed.
    fn remaining(&self) -> Result<Option<Duration>> {
        match self.0 {
            None => Ok(None),
            Some(at) => {
                let now = clock::monotonic64();
                if now >= at {
                    Err(Error::Timeout)
                } else {
                    Ok(Some(Duration::from_nanos(at - now)))
                }
            }
        }
    }
}

fn nanos(dur: Duration) -> u64 {
    dur.as_nanos().min(u64::MAX as u128) as u64
}

////////////////////////////////////////////////////////////////////////////////
// Primitives
////////////////////////////////////////////////////////////////////////////////

/// Accept a connection on the listening socket `fd`.
///
/// Returns the accepted descriptor, already switched to non-blocking mode,
/// and the peer address.
pub fn accept(fd: RawFd, timeout: Option<Duration>) -> Result<(RawFd, SocketAddr)> {
    let deadline = OpDeadline::new(timeout);
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::accept(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc >= 0 {
            let guard = FdGuard(rc);
            set_nonblocking(rc)?;
            let peer = sockaddr_to(&storage)?;
            mem::forget(guard);
            return Ok((rc, peer));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
            _ if err.kind() == io::ErrorKind::WouldBlock => {
                wait(fd, Direction::Read, deadline.remaining()?)?;
            }
            _ => return Err(err.into()),
        }
    }
}

/// Connect the non-blocking socket `fd` to `addr`.
///
/// "In progress" parks the fiber until the socket is writable, then the
/// pending socket error is queried to resolve the outcome.
pub fn connect(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EINTR) => {}
        Some(libc::EISCONN) => return Ok(()),
        _ => return Err(err.into()),
    }

    wait(fd, Direction::Write, timeout)?;

    let mut so_error: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut c_void,
            &mut optlen,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error).into());
    }
    Ok(())
}

/// Send some bytes from `buf` on `fd`. Returns how many were written.
pub fn send(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
    let deadline = OpDeadline::new(timeout);
    loop {
        let rc = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                wait(fd, Direction::Write, deadline.remaining()?)?;
            }
            _ => return Err(err.into()),
        }
    }
}

/// Pull some bytes from `fd` into `buf`. An orderly shutdown by the peer is
/// reported as `Ok(0)`.
pub fn recv(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
    let deadline = OpDeadline::new(timeout);
    loop {
        let rc = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                wait(fd, Direction::Read, deadline.remaining()?)?;
            }
            _ => return Err(err.into()),
        }
    }
}

/// Send one datagram from `buf` to `dest`.
pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    dest: &SocketAddr,
    timeout: Option<Duration>,
) -> Result<usize> {
    let deadline = OpDeadline::new(timeout);
    let (storage, len) = sockaddr_from(dest);
    loop {
        let rc = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                SEND_FLAGS,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                wait(fd, Direction::Write, deadline.remaining()?)?;
            }
            _ => return Err(err.into()),
        }
    }
}

/// Receive one datagram into `buf`. Returns the byte count and the sender.
pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<(usize, SocketAddr)> {
    let deadline = OpDeadline::new(timeout);
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc >= 0 {
            let src = sockaddr_to(&storage)?;
            return Ok((rc as usize, src));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                wait(fd, Direction::Read, deadline.remaining()?)?;
            }
            _ => return Err(err.into()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Owning socket wrappers
////////////////////////////////////////////////////////////////////////////////

/// Closes the fd unless defused with `mem::forget`. Covers the error paths
/// between creating a descriptor and handing it to an owner.
struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Fresh non-blocking socket in the address family of `addr`.
fn new_socket(addr: &SocketAddr, sock_type: libc::c_int) -> Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, sock_type, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let guard = FdGuard(fd);
    set_nonblocking(fd)?;
    mem::forget(guard);
    Ok(fd)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                };
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )
        .into()),
    }
}

fn local_addr_of(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    sockaddr_to(&storage)
}

/// A connected TCP socket polled through the fiber event loop.
///
/// Owns its descriptor: dropping the stream closes it, whichever way the
/// owning fiber exits.
pub struct CoStream {
    fd: RawFd,
}

impl CoStream {
    /// Convert an fd-like object into a `CoStream`, switching it to
    /// non-blocking mode.
    pub fn new<T>(inner: T) -> Result<CoStream>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        let guard = FdGuard(fd);
        set_nonblocking(fd)?;
        mem::forget(guard);
        Ok(CoStream { fd })
    }

    pub(crate) fn from_fd(fd: RawFd) -> CoStream {
        CoStream { fd }
    }

    /// Open a TCP connection to `addr`.
    pub fn connect(addr: &SocketAddr) -> Result<CoStream> {
        Self::connect_timeout(addr, None)
    }

    /// Open a TCP connection to `addr`, bounded by `timeout`.
    pub fn connect_timeout(addr: &SocketAddr, timeout: Option<Duration>) -> Result<CoStream> {
        let fd = new_socket(addr, libc::SOCK_STREAM)?;
        let guard = FdGuard(fd);
        connect(fd, addr, timeout)?;
        mem::forget(guard);
        Ok(CoStream { fd })
    }

    /// Pull some bytes into `buf`. Returns how many bytes were read; `Ok(0)`
    /// means the peer closed.
    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        recv(self.fd, buf, timeout)
    }

    /// Write some bytes from `buf`. Returns how many bytes were written.
    pub fn write_with_timeout(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        send(self.fd, buf, timeout)
    }

    /// Write the whole of `buf`, waiting as often as needed within
    /// `timeout`.
    pub fn write_all_with_timeout(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = OpDeadline::new(timeout);
        let mut written = 0;
        while written < buf.len() {
            written += send(self.fd, &buf[written..], deadline.remaining()?)?;
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        local_addr_of(self.fd)
    }
}

impl AsRawFd for CoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Read for CoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None).map_err(Into::into)
    }
}

impl Write for CoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CoStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// A listening TCP socket polled through the fiber event loop.
pub struct CoListener {
    fd: RawFd,
}

impl CoListener {
    /// Create a listening socket on `addr`: `SO_REUSEADDR`, non-blocking,
    /// bound, with the default backlog.
    pub fn bind(addr: &SocketAddr) -> Result<CoListener> {
        Self::bind_with_backlog(addr, DEFAULT_BACKLOG)
    }

    pub fn bind_with_backlog(addr: &SocketAddr, backlog: libc::c_int) -> Result<CoListener> {
        let fd = new_socket(addr, libc::SOCK_STREAM)?;
        let guard = FdGuard(fd);

        let enable: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &enable as *const _ as *const c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let (storage, len) = sockaddr_from(addr);
        if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if unsafe { libc::listen(fd, backlog) } < 0 {
            return Err(io::Error::last_os_error().into());
        }

        mem::forget(guard);
        Ok(CoListener { fd })
    }

    /// Accept a new incoming connection from this listener. Yields.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<(CoStream, SocketAddr)> {
        let (fd, peer) = accept(self.fd, timeout)?;
        debug!("accepted connection from {} (fd {})", peer, fd);
        Ok((CoStream::from_fd(fd), peer))
    }

    /// The address this listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        local_addr_of(self.fd)
    }
}

impl AsRawFd for CoListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoListener {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// A UDP socket polled through the fiber event loop.
pub struct CoDgram {
    fd: RawFd,
}

impl CoDgram {
    /// Unbound datagram socket in the given address family.
    pub fn unbound(ipv4: bool) -> Result<CoDgram> {
        let domain = if ipv4 { libc::AF_INET } else { libc::AF_INET6 };
        let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let guard = FdGuard(fd);
        set_nonblocking(fd)?;
        mem::forget(guard);
        Ok(CoDgram { fd })
    }

    /// Datagram socket bound to `addr`.
    pub fn bind(addr: &SocketAddr) -> Result<CoDgram> {
        let fd = new_socket(addr, libc::SOCK_DGRAM)?;
        let guard = FdGuard(fd);
        let (storage, len) = sockaddr_from(addr);
        if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        mem::forget(guard);
        Ok(CoDgram { fd })
    }

    pub fn send_to(
        &self,
        buf: &[u8],
        dest: &SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        sendto(self.fd, buf, dest, timeout)
    }

    pub fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(usize, SocketAddr)> {
        recvfrom(self.fd, buf, timeout)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        local_addr_of(self.fd)
    }
}

impl AsRawFd for CoDgram {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoDgram {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// Framing and composites
////////////////////////////////////////////////////////////////////////////////

/// Verdict of a framing predicate over the bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCheck {
    /// The first `usize` bytes form a complete frame.
    Complete(usize),
    /// More bytes are needed.
    Partial,
    /// The bytes can never form a valid frame.
    Malformed,
}

/// Decides when an accumulating reply is complete.
///
/// Wire parsers (HTTP and friends) stay outside the runtime; they plug in
/// here. Implemented for free by any `Fn(&[u8]) -> FrameCheck` closure.
pub trait IsComplete {
    fn check_frame(&self, buf: &[u8]) -> FrameCheck;
}

impl<F> IsComplete for F
where
    F: Fn(&[u8]) -> FrameCheck,
{
    fn check_frame(&self, buf: &[u8]) -> FrameCheck {
        self(buf)
    }
}

/// Send one datagram to `dest` and receive one reply.
///
/// A fresh non-blocking datagram socket is scoped to the call and closed on
/// every exit path.
pub fn udp_send_and_recv(
    dest: &SocketAddr,
    msg: &[u8],
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let deadline = OpDeadline::new(timeout);
    let sock = CoDgram::unbound(dest.is_ipv4())?;
    sock.send_to(msg, dest, deadline.remaining()?)?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (n, _src) = sock.recv_from(&mut buf, deadline.remaining()?)?;
    buf.truncate(n);
    Ok(buf)
}

/// Connect to `dest`, send the whole `request`, and receive bytes until
/// `is_complete` recognizes a full reply.
///
/// The reply buffer starts at 512 bytes and doubles whenever a read fills
/// it completely. The connection is scoped to the call and closed on every
/// exit path. Errors:
///
/// - [`Error::PeerClosed`] - the peer shut down before the frame completed
/// - [`Error::Malformed`] - `is_complete` rejected the bytes
/// - [`Error::Timeout`] - the deadline expired first
pub fn tcp_send_and_recv<C>(
    dest: &SocketAddr,
    request: &[u8],
    is_complete: &C,
    timeout: Option<Duration>,
) -> Result<Vec<u8>>
where
    C: IsComplete + ?Sized,
{
    let deadline = OpDeadline::new(timeout);
    let mut stream = CoStream::connect_timeout(dest, deadline.remaining()?)?;
    stream.write_all_with_timeout(request, deadline.remaining()?)?;

    let mut reply = vec![0u8; INITIAL_REPLY_BUF];
    let mut recvd = 0;
    loop {
        if recvd == reply.len() {
            let grown = reply.len() * 2;
            reply.resize(grown, 0);
        }
        let n = stream.read_with_timeout(&mut reply[recvd..], deadline.remaining()?)?;
        if n == 0 {
            return Err(Error::PeerClosed);
        }
        recvd += n;
        match is_complete.check_frame(&reply[..recvd]) {
            FrameCheck::Complete(frame_len) => {
                reply.truncate(frame_len.min(recvd));
                return Ok(reply);
            }
            FrameCheck::Partial => {}
            FrameCheck::Malformed => return Err(Error::Malformed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fiber, sched};
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn with_runtime(f: impl FnOnce()) {
        sched::init().unwrap();
        f();
        sched::fini().unwrap();
    }

    /// Socketpair whose halves are owned as raw fds closed by CoStream.
    fn pair() -> (CoStream, CoStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (CoStream::new(a).unwrap(), CoStream::new(b).unwrap())
    }

    #[test]
    fn blocked_reader_resumes_when_bytes_arrive() {
        with_runtime(|| {
            let (a, b) = pair();
            let got = Rc::new(RefCell::new(Vec::new()));

            let got_in_fiber = got.clone();
            let mut a = a;
            fiber::spawn(move || {
                let mut buf = [0u8; 16];
                let n = a.read_with_timeout(&mut buf, None).unwrap();
                got_in_fiber.borrow_mut().extend_from_slice(&buf[..n]);
                0
            })
            .unwrap();

            let mut b = b;
            fiber::spawn(move || {
                // The reader is already parked; this write wakes it.
                b.write_all_with_timeout(b"ping", None).unwrap();
                0
            })
            .unwrap();

            sched::schedule().unwrap();
            assert_eq!(&*got.borrow(), b"ping");
        });
    }

    #[test]
    fn second_waiter_on_same_fd_fails_fast() {
        with_runtime(|| {
            let (a, b) = pair();
            let contended_fd = a.as_raw_fd();
            let verdict = Rc::new(RefCell::new(None));

            let mut a = a;
            fiber::spawn(move || {
                let mut buf = [0u8; 4];
                a.read_with_timeout(&mut buf, None).unwrap();
                0
            })
            .unwrap();

            let verdict_in_fiber = verdict.clone();
            fiber::spawn(move || {
                let mut buf = [0u8; 4];
                let res = recv(contended_fd, &mut buf, None);
                *verdict_in_fiber.borrow_mut() = Some(matches!(res, Err(Error::FdBusy(_))));
                0
            })
            .unwrap();

            let mut b = b;
            fiber::spawn(move || {
                b.write_all_with_timeout(b"done", None).unwrap();
                0
            })
            .unwrap();

            sched::schedule().unwrap();
            assert_eq!(*verdict.borrow(), Some(true));
        });
    }

    #[test]
    fn recv_times_out_on_a_silent_peer() {
        with_runtime(|| {
            let (a, _b) = pair();
            let elapsed = Rc::new(RefCell::new(None));

            let elapsed_in_fiber = elapsed.clone();
            let mut a = a;
            fiber::spawn(move || {
                let started = clock::monotonic64();
                let mut buf = [0u8; 4];
                let res = a.read_with_timeout(&mut buf, Some(Duration::from_millis(80)));
                let took = Duration::from_nanos(clock::monotonic64() - started);
                *elapsed_in_fiber.borrow_mut() = Some((matches!(res, Err(Error::Timeout)), took));
                0
            })
            .unwrap();

            // Keep `_b` alive until the scheduler finishes, so the reader
            // times out instead of seeing a peer close.
            let guard = _b;
            fiber::spawn(move || {
                fiber::sleep(Duration::from_millis(200));
                drop(guard);
                0
            })
            .unwrap();

            sched::schedule().unwrap();

            let recorded = *elapsed.borrow();
            let (timed_out, took) = recorded.unwrap();
            assert!(timed_out);
            assert!(took >= Duration::from_millis(60), "took {:?}", took);
            assert!(took < Duration::from_millis(500), "took {:?}", took);
        });
    }

    #[test]
    fn peer_close_reads_as_zero() {
        with_runtime(|| {
            let (a, b) = pair();
            let result = Rc::new(RefCell::new(None));

            let result_in_fiber = result.clone();
            let mut a = a;
            fiber::spawn(move || {
                let mut buf = [0u8; 4];
                let n = a.read_with_timeout(&mut buf, None).unwrap();
                *result_in_fiber.borrow_mut() = Some(n);
                0
            })
            .unwrap();

            fiber::spawn(move || {
                drop(b);
                0
            })
            .unwrap();

            sched::schedule().unwrap();
            assert_eq!(*result.borrow(), Some(0));
        });
    }

    #[test]
    fn frame_check_closures_implement_is_complete() {
        let newline_framed = |buf: &[u8]| match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => FrameCheck::Complete(pos + 1),
            None if buf.len() > 64 => FrameCheck::Malformed,
            None => FrameCheck::Partial,
        };
        assert_eq!(newline_framed.check_frame(b"hi"), FrameCheck::Partial);
        assert_eq!(newline_framed.check_frame(b"hi\nrest"), FrameCheck::Complete(3));
        assert_eq!(newline_framed.check_frame(&[b'x'; 65]), FrameCheck::Malformed);
    }

    #[test]
    fn udp_round_trip_through_an_echo_fiber() {
        with_runtime(|| {
            let responder = CoDgram::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
            let responder_addr = responder.local_addr().unwrap();
            let echoed = Rc::new(RefCell::new(None));

            fiber::spawn(move || {
                let mut buf = [0u8; 128];
                let (n, src) = responder.recv_from(&mut buf, None).unwrap();
                responder.send_to(&buf[..n], &src, None).unwrap();
                0
            })
            .unwrap();

            let echoed_in_fiber = echoed.clone();
            fiber::spawn(move || {
                let reply = udp_send_and_recv(
                    &responder_addr,
                    b"marco",
                    Some(Duration::from_secs(5)),
                )
                .unwrap();
                *echoed_in_fiber.borrow_mut() = Some(reply);
                0
            })
            .unwrap();

            sched::schedule().unwrap();
            assert_eq!(echoed.borrow().as_deref(), Some(&b"marco"[..]));
        });
    }
}
