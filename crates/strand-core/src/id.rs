//! Coroutine identifiers

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide unique coroutine id.
///
/// Ids are assigned from a monotonic counter starting at 1; id 0 is
/// reserved for "no coroutine" (a thread's main context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(pub u64);

impl CoroutineId {
    /// The main-context sentinel.
    pub const MAIN: CoroutineId = CoroutineId(0);

    /// Allocate the next id.
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        CoroutineId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for logging.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = CoroutineId::next();
        let b = CoroutineId::next();
        let c = CoroutineId::next();
        assert!(a < b && b < c);
        assert_ne!(a, CoroutineId::MAIN);
    }
}
