//! Epoll registry: fd ↔ waiting-coroutine associations
//!
//! Each processor owns one epoll instance. An fd has at most one reader
//! and one writer waiting; the kernel interest mask is always the union of
//! the occupied slots. Registrations are level-triggered: a readiness that
//! lands between the failed syscall and the waiter registration is still
//! reported by the next `epoll_wait`.
//!
//! All methods are owning-thread-only; the `Processor` wrappers assert
//! that before forwarding here.

use crate::coroutine::Coroutine;
use crate::fatal;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::trace;

/// Readiness direction a coroutine waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Default)]
struct FdWaiters {
    reader: Option<Rc<Coroutine>>,
    writer: Option<Rc<Coroutine>>,
    /// True once the fd is in the kernel set (first call ADDs, the rest MOD).
    registered: bool,
    /// Mirror of the kernel interest mask, for the union invariant.
    mask: u32,
}

impl FdWaiters {
    fn wanted_mask(&self) -> u32 {
        let mut mask = 0;
        if self.reader.is_some() {
            mask |= libc::EPOLLIN as u32;
        }
        if self.writer.is_some() {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }
}

pub(crate) struct Epoll {
    epfd: RawFd,
    fds: RefCell<HashMap<RawFd, FdWaiters>>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            fds: RefCell::new(HashMap::new()),
        })
    }

    /// Register `co` as the waiter for `dir` on `fd`.
    ///
    /// A second waiter for an already-waited direction is a programming
    /// error and aborts.
    pub fn add_waiter(&self, fd: RawFd, dir: Direction, co: Rc<Coroutine>) {
        let mut fds = self.fds.borrow_mut();
        let entry = fds.entry(fd).or_default();
        let slot = match dir {
            Direction::Read => &mut entry.reader,
            Direction::Write => &mut entry.writer,
        };
        if slot.is_some() {
            fatal!("second {:?} waiter on fd {}", dir, fd);
        }
        trace!(fd, ?dir, co = co.id().raw(), "epoll waiter armed");
        *slot = Some(co);
        self.sync_mask(fd, entry);
    }

    /// Drop the waiter for `dir` on `fd`, if any. The fd stays in the
    /// kernel set for subsequent operations.
    pub fn clear_waiter(&self, fd: RawFd, dir: Direction) -> Option<Rc<Coroutine>> {
        let mut fds = self.fds.borrow_mut();
        let entry = fds.get_mut(&fd)?;
        let taken = match dir {
            Direction::Read => entry.reader.take(),
            Direction::Write => entry.writer.take(),
        };
        if taken.is_some() {
            self.sync_mask(fd, entry);
        }
        taken
    }

    /// Deregister `fd` entirely. Returns any waiters still parked on it,
    /// reader first, so the caller can resume each exactly once.
    pub fn remove(&self, fd: RawFd) -> Vec<Rc<Coroutine>> {
        let mut fds = self.fds.borrow_mut();
        let Some(entry) = fds.remove(&fd) else {
            return Vec::new();
        };
        if entry.registered {
            let ret = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret != 0 {
                trace!(fd, "epoll del failed: {}", io::Error::last_os_error());
            }
        }
        entry.reader.iter().chain(entry.writer.iter()).cloned().collect()
    }

    /// Take the waiters woken by `revents` on `fd`, reader first.
    /// Error and hangup conditions release both slots; the retried
    /// syscalls observe the failure.
    pub fn take_ready(
        &self,
        fd: RawFd,
        revents: u32,
    ) -> (Option<Rc<Coroutine>>, Option<Rc<Coroutine>>) {
        let mut fds = self.fds.borrow_mut();
        let Some(entry) = fds.get_mut(&fd) else {
            return (None, None);
        };

        let broken = revents & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
        let reader = if broken || revents & libc::EPOLLIN as u32 != 0 {
            entry.reader.take()
        } else {
            None
        };
        let writer = if broken || revents & libc::EPOLLOUT as u32 != 0 {
            entry.writer.take()
        } else {
            None
        };
        if reader.is_some() || writer.is_some() {
            self.sync_mask(fd, entry);
        }
        (reader, writer)
    }

    /// Take every parked waiter across all fds (shutdown path). The fds
    /// stay registered; their processors are about to go away anyway.
    pub fn drain_waiters(&self) -> Vec<Rc<Coroutine>> {
        let mut fds = self.fds.borrow_mut();
        let mut out = Vec::new();
        for (fd, entry) in fds.iter_mut() {
            if let Some(co) = entry.reader.take() {
                out.push(co);
            }
            if let Some(co) = entry.writer.take() {
                out.push(co);
            }
            self.sync_mask(*fd, entry);
        }
        out
    }

    /// Block for readiness up to `timeout_ms`. Fills `events`; EINTR is
    /// reported as an empty round.
    pub fn wait(&self, timeout_ms: i32, events: &mut [libc::epoll_event]) -> usize {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                fatal!("epoll_wait failed: {}", err);
            }
            return 0;
        }
        n as usize
    }

    /// Push the union-of-slots mask to the kernel: ADD on first contact,
    /// MOD afterwards.
    fn sync_mask(&self, fd: RawFd, entry: &mut FdWaiters) {
        let mask = entry.wanted_mask();
        let op = if entry.registered {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret != 0 {
            fatal!(
                "epoll_ctl({}) on fd {} failed: {}",
                if op == libc::EPOLL_CTL_ADD { "add" } else { "mod" },
                fd,
                io::Error::last_os_error()
            );
        }
        entry.registered = true;
        entry.mask = mask;
    }

    #[cfg(test)]
    pub fn interest_mask(&self, fd: RawFd) -> Option<u32> {
        self.fds.borrow().get(&fd).map(|e| e.mask)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
