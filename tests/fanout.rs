//! Forked listener fan-out: a pool of acceptor processes behind one
//! listening socket, serialized by the advisory lock, serving real TCP
//! clients.

use std::io::{Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::time::{Duration, Instant};

use fibrio::coio::CoStream;
use fibrio::sched;

/// Grab an ephemeral port and release it for the server to claim.
///
/// The listener itself must be created inside the server process (after the
/// fork), so the port travels by number.
fn reserve_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn echo_work(mut stream: CoStream) -> i32 {
    let mut buf = [0u8; 512];
    loop {
        match stream.read_with_timeout(&mut buf, None) {
            Ok(0) => return 0,
            Ok(n) => {
                if stream.write_all_with_timeout(&buf[..n], None).is_err() {
                    return -1;
                }
            }
            Err(_) => return -1,
        }
    }
}

/// Runs in the forked server: never returns on success.
fn run_server(port: u16) -> i32 {
    if sched::init().is_err() {
        return 10;
    }
    let addr = SocketAddrV4::new([127, 0, 0, 1].into(), port);
    match fibrio::listen_and_accept(addr, 2, |stream, _peer| move || echo_work(stream)) {
        Ok(()) => 0,
        Err(_) => 11,
    }
}

fn connect_with_retry(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(e) => {
                assert!(
                    Instant::now() < deadline,
                    "server never came up: {}",
                    e
                );
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

#[test]
fn forked_pool_serves_sequential_connections() {
    let port = reserve_port();

    let child = unsafe { libc::fork() };
    assert!(child >= 0, "fork failed");

    if child == 0 {
        // Own process group, so killing the pool catches the grandchild
        // forked by the fan-out as well.
        unsafe { libc::setpgid(0, 0) };
        let code = run_server(port);
        unsafe { libc::_exit(code) };
    }

    // Four sequential connections: with a pool of 2 every one must be
    // served no matter which process won the accept lock for it.
    for round in 0..4u8 {
        let mut stream = connect_with_retry(port);
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let msg = [b'm', round];
        stream.write_all(&msg).unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, msg);
        drop(stream);
    }

    // Tear the pool down.
    unsafe {
        libc::kill(-child, libc::SIGKILL);
        let mut status = 0;
        libc::waitpid(child, &mut status, 0);
    }
}
