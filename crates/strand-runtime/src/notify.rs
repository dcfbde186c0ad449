//! Eventfd wakeup channel
//!
//! One per processor. Any thread may `notify`; only the owning thread
//! reads. Eventfd counter semantics coalesce bursts of notifications into
//! a single wakeup.

use std::io;
use std::os::unix::io::RawFd;

pub struct WakeupFd {
    fd: RawFd,
}

impl WakeupFd {
    /// Create a fresh non-blocking, close-on-exec eventfd.
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Raw descriptor, for registration in the owner's epoll set.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bump the counter. Callable from any thread.
    pub fn notify(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let errno = io::Error::last_os_error();
            // EAGAIN means the counter is saturated, so a wakeup is
            // already pending.
            if errno.raw_os_error() != Some(libc::EAGAIN) {
                tracing::error!("eventfd write failed: {}", errno);
            }
        } else if n as usize != std::mem::size_of::<u64>() {
            tracing::error!("eventfd wrote {} bytes instead of 8", n);
        }
    }
}

impl Drop for WakeupFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_read_counts() {
        let wake = WakeupFd::new().expect("eventfd");
        wake.notify();
        wake.notify();
        wake.notify();

        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                wake.fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);
        assert_eq!(count, 3);
    }

    #[test]
    fn empty_read_would_block() {
        let wake = WakeupFd::new().expect("eventfd");
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                wake.fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, -1);
        assert_eq!(
            io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN)
        );
    }
}
