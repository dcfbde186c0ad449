//! Blocking-looking I/O over non-blocking descriptors
//!
//! Rust has no symbol-level syscall interposition, so "hooking" is an
//! explicit API with the interposition contract: each operation attempts
//! the non-blocking syscall, and on `EAGAIN` parks the calling coroutine
//! on fd readiness in the owning processor's epoll set, arming a one-shot
//! timeout from the socket's `SO_RCVTIMEO`/`SO_SNDTIMEO` when present.
//! `EINTR` is retried internally and never surfaced.
//!
//! Called outside a coroutine (or with hooking disabled for the thread),
//! every operation falls through to a plain `poll(2)` wait, so the same
//! code runs unhooked with ordinary blocking behavior.

use crate::coroutine::Coroutine;
use crate::poller::Direction;
use crate::timer::TimerPayload;
use crate::tls;

use strand_core::{NetError, NetResult, WakeReason};

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::trace;

/// Read into `buf`, suspending until readable. `Ok(0)` is end of stream.
pub fn read(fd: RawFd, buf: &mut [u8]) -> NetResult<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => wait_ready(fd, Direction::Read, recv_timeout(fd))?,
            err => return Err(os_error(err)),
        }
    }
}

/// Write from `buf`, suspending until writable. May write fewer bytes
/// than requested; see [`write_all`] for the draining loop.
pub fn write(fd: RawFd, buf: &[u8]) -> NetResult<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => wait_ready(fd, Direction::Write, send_timeout(fd))?,
            err => return Err(os_error(err)),
        }
    }
}

/// Write the whole of `buf`, suspending between partial writes.
pub fn write_all(fd: RawFd, buf: &[u8]) -> NetResult<()> {
    let mut sent = 0;
    while sent < buf.len() {
        sent += write(fd, &buf[sent..])?;
    }
    Ok(())
}

/// Accept a connection, suspending until one is pending. The accepted fd
/// comes back non-blocking and close-on-exec.
pub fn accept(fd: RawFd) -> NetResult<RawFd> {
    loop {
        let conn = unsafe {
            libc::accept4(
                fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if conn >= 0 {
            return Ok(conn);
        }
        match errno() {
            // A connection that died between arrival and accept is not
            // the listener's problem.
            libc::EINTR | libc::ECONNABORTED => continue,
            libc::EAGAIN => wait_ready(fd, Direction::Read, recv_timeout(fd))?,
            err => return Err(os_error(err)),
        }
    }
}

/// Connect `fd` to `addr`, suspending through the in-progress phase.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> NetResult<()> {
    let (storage, len) = sockaddr_from(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        return Ok(());
    }
    match errno() {
        libc::EINPROGRESS | libc::EINTR => {}
        libc::EISCONN => return Ok(()),
        err => return Err(os_error(err)),
    }

    wait_ready(fd, Direction::Write, send_timeout(fd))?;

    // Writability after EINPROGRESS means the handshake finished one way
    // or the other; SO_ERROR says which.
    let err = socket_error(fd)?;
    if err == 0 {
        Ok(())
    } else {
        Err(os_error(err))
    }
}

/// Suspend the current coroutine for `duration`. Outside a coroutine this
/// is a plain thread sleep.
pub fn sleep(duration: Duration) {
    if !hooked() {
        std::thread::sleep(duration);
        return;
    }
    let proc = tls::current_processor().unwrap();
    let co = tls::current_coroutine().unwrap();
    proc.add_timer(
        TimerPayload::Resume(co.clone()),
        Instant::now() + duration,
        None,
    );
    Coroutine::swap_out();
    // Woken by the timer, or by cancellation at shutdown; either ends
    // the sleep.
    let _ = co.take_wake_reason();
}

/// Park until `fd` is readable, bounded by `timeout`.
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> NetResult<()> {
    wait_ready(fd, Direction::Read, timeout)
}

/// Park until `fd` is writable, bounded by `timeout`.
pub fn wait_writable(fd: RawFd, timeout: Option<Duration>) -> NetResult<()> {
    wait_ready(fd, Direction::Write, timeout)
}

/// True when the calling context can suspend: hooking enabled for this
/// thread, with a current coroutine and processor.
fn hooked() -> bool {
    tls::is_hook_enabled() && tls::is_in_coroutine() && tls::current_processor().is_some()
}

/// The suspension primitive. Registers the current coroutine as the
/// (fd, direction) waiter, arms the optional one-shot timeout, swaps out,
/// and maps the wake reason on resumption:
///
/// - readiness: cancel the timer, `Ok` (caller retries the syscall)
/// - timer: clear the fd slot, `TimedOut`
/// - cancelled (fd closed, shutdown): cancel the timer, `Cancelled`
fn wait_ready(fd: RawFd, dir: Direction, timeout: Option<Duration>) -> NetResult<()> {
    if !hooked() {
        return poll_fallback(fd, dir, timeout);
    }

    let proc = tls::current_processor().unwrap();
    let co = tls::current_coroutine().unwrap();

    proc.update_event(fd, dir, co.clone());
    let timer = timeout.map(|d| {
        proc.add_timer(TimerPayload::Resume(co.clone()), Instant::now() + d, None)
    });

    Coroutine::swap_out();

    match co.take_wake_reason() {
        WakeReason::Readiness => {
            if let Some(seq) = timer {
                proc.cancel_timer(seq);
            }
            Ok(())
        }
        WakeReason::Timer => {
            trace!(fd, ?dir, "hooked wait timed out");
            proc.clear_waiter(fd, dir);
            Err(NetError::TimedOut)
        }
        WakeReason::Cancelled => {
            if let Some(seq) = timer {
                proc.cancel_timer(seq);
            }
            Err(NetError::Cancelled)
        }
    }
}

/// Unhooked fall-through: block the thread in `poll(2)`.
fn poll_fallback(fd: RawFd, dir: Direction, timeout: Option<Duration>) -> NetResult<()> {
    let events = match dir {
        Direction::Read => libc::POLLIN,
        Direction::Write => libc::POLLOUT,
    };
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = timeout.map_or(-1i32, |d| d.as_millis().min(i32::MAX as u128) as i32);
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret > 0 {
            // Error and hangup surface through the retried syscall.
            return Ok(());
        }
        if ret == 0 {
            return Err(NetError::TimedOut);
        }
        if errno() != libc::EINTR {
            return Err(NetError::last_os_error());
        }
    }
}

#[inline]
fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Fold the peer-closed errno family; everything else stays an I/O error.
fn os_error(errno: i32) -> NetError {
    match errno {
        libc::EPIPE | libc::ECONNRESET => NetError::PeerClosed,
        err => NetError::Io(io::Error::from_raw_os_error(err)),
    }
}

/// `SO_RCVTIMEO`, when `fd` is a socket that carries one.
fn recv_timeout(fd: RawFd) -> Option<Duration> {
    socket_timeout(fd, libc::SO_RCVTIMEO)
}

/// `SO_SNDTIMEO`, when `fd` is a socket that carries one.
fn send_timeout(fd: RawFd) -> Option<Duration> {
    socket_timeout(fd, libc::SO_SNDTIMEO)
}

fn socket_timeout(fd: RawFd, opt: libc::c_int) -> Option<Duration> {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let mut len = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut tv as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    // Non-sockets (eventfd, pipes) fail with ENOTSOCK: no deadline.
    if ret != 0 || (tv.tv_sec == 0 && tv.tv_usec == 0) {
        return None;
    }
    Some(Duration::new(tv.tv_sec as u64, tv.tv_usec as u32 * 1000))
}

fn socket_error(fd: RawFd) -> NetResult<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(NetError::last_os_error());
    }
    Ok(err)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn unhooked_read_blocks_until_data() {
        let (rd, wr) = nonblocking_pipe();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let data = b"ping";
            unsafe { libc::write(wr, data.as_ptr() as *const libc::c_void, data.len()) };
            wr
        });

        let mut buf = [0u8; 16];
        let n = read(rd, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"ping");

        let wr = writer.join().unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn unhooked_wait_times_out() {
        let (rd, wr) = nonblocking_pipe();
        let t0 = Instant::now();
        let err = wait_readable(rd, Some(Duration::from_millis(80))).unwrap_err();
        assert!(matches!(err, NetError::TimedOut));
        assert!(t0.elapsed() >= Duration::from_millis(80));
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn eof_reads_as_zero() {
        let (rd, wr) = nonblocking_pipe();
        unsafe { libc::close(wr) };
        let mut buf = [0u8; 4];
        assert_eq!(read(rd, &mut buf).expect("read"), 0);
        unsafe { libc::close(rd) };
    }

    #[test]
    fn write_to_closed_reader_is_peer_closed() {
        // Writing into a closed pipe raises SIGPIPE; the runtime ignores
        // it at scheduler construction, this test stands alone.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        let (rd, wr) = nonblocking_pipe();
        unsafe { libc::close(rd) };
        let err = write(wr, b"hello").unwrap_err();
        assert!(matches!(err, NetError::PeerClosed));
        unsafe { libc::close(wr) };
    }
}
