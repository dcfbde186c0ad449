//! Coroutine stack memory
//!
//! Each coroutine gets its own anonymous mapping with a PROT_NONE guard
//! page at the low end, so an overflow faults instead of scribbling over a
//! neighbouring allocation. Stacks are reused across coroutine lifetimes
//! through the processor's idle list, not through this type.

use std::io;
use std::ptr;

const PAGE_SIZE: usize = 4096;

/// A guard-paged coroutine stack.
pub struct Stack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

impl Stack {
    /// Map a stack with at least `size` usable bytes plus a guard page.
    pub fn new(size: usize) -> io::Result<Self> {
        let usable = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let total = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Guard page at the low end; growth is downward.
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(Self {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// One-past-the-end pointer; the initial stack pointer for a fresh
    /// context (aligned down to 16 by `init_context`).
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes, excluding the guard page.
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_rounds_up() {
        let stack = Stack::new(1).expect("mmap");
        assert_eq!(stack.size(), PAGE_SIZE);

        let stack = Stack::new(128 * 1024).expect("mmap");
        assert_eq!(stack.size(), 128 * 1024);
        assert!(!stack.top().is_null());
    }

    #[test]
    fn top_is_above_base_by_total() {
        let stack = Stack::new(64 * 1024).expect("mmap");
        let top = stack.top() as usize;
        assert_eq!(top - stack.base as usize, stack.total);
    }
}
