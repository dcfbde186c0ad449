//! Per-processor timer queue
//!
//! A min-heap keyed by (deadline, insertion sequence) with lazy
//! cancellation: `cancel` marks the sequence number in a set and the entry
//! is discarded when it reaches the head. Any thread may insert callback
//! timers or cancel; coroutine-resume entries are created and dispatched
//! only on the owning thread.
//!
//! # Complexity
//!
//! - insert: O(log n)
//! - cancel: O(1) amortized
//! - expired drain: O(k log n) for k due entries

use crate::coroutine::Coroutine;
use crate::processor::Processor;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// What to do when a deadline fires.
pub(crate) enum TimerPayload {
    /// Run the callback as a fresh task on the owning processor.
    /// `Arc` because periodic entries fire it repeatedly.
    Task {
        cb: Arc<dyn Fn() + Send + Sync>,
        name: String,
    },

    /// Resume a suspended coroutine on the owning processor.
    Resume(Rc<Coroutine>),
}

// SAFETY: `Resume` entries are inserted, dispatched and dropped only on
// the processor's owning thread. Other threads insert `Task` entries and
// mark cancellations, which never touch a payload.
unsafe impl Send for TimerPayload {}

/// Handle for cancelling a scheduled timer.
///
/// Carries a non-owning reference to the processor whose queue holds the
/// entry, so the scheduler can route `cancel` without a lookup.
#[derive(Clone)]
pub struct TimerId {
    pub(crate) owner: Weak<Processor>,
    pub(crate) seq: u64,
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerId").field("seq", &self.seq).finish()
    }
}

struct HeapEntry {
    deadline: Instant,
    seq: u64,
    interval: Option<Duration>,
    payload: TimerPayload,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; sequence breaks deadline ties in
        // insertion order.
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

/// Ordered multiset of deadlines for one processor.
pub(crate) struct TimerQueue {
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                next_seq: 1,
            }),
        }
    }

    /// Insert an entry. Returns its sequence number and whether it became
    /// the new head (caller shortens the poll timeout via the wakeup fd).
    pub fn insert(
        &self,
        payload: TimerPayload,
        deadline: Instant,
        interval: Option<Duration>,
    ) -> (u64, bool) {
        let mut inner = self.inner.lock().unwrap();
        let prev_head = inner.heap.peek().map(|e| e.deadline);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(HeapEntry {
            deadline,
            seq,
            interval,
            payload,
        });
        let became_head = prev_head.map_or(true, |prev| deadline < prev);
        (seq, became_head)
    }

    /// Mark a timer cancelled. Idempotent; harmless after expiry.
    pub fn cancel(&self, seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled.insert(seq);
        if inner.heap.is_empty() {
            inner.cancelled.clear();
        }
    }

    /// Drain every entry whose deadline has passed, skipping cancelled
    /// ones. Periodic entries are reinserted at `deadline + interval`
    /// under their original sequence number, so their `TimerId` stays
    /// valid for cancellation.
    pub fn expired(&self, now: Instant) -> Vec<TimerPayload> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        let mut reinsert = Vec::new();

        while let Some(head) = inner.heap.peek() {
            if head.deadline > now {
                break;
            }
            let entry = inner.heap.pop().unwrap();
            if inner.cancelled.remove(&entry.seq) {
                continue;
            }
            match (&entry.payload, entry.interval) {
                (TimerPayload::Task { cb, name }, Some(interval)) => {
                    reinsert.push(HeapEntry {
                        deadline: entry.deadline + interval,
                        seq: entry.seq,
                        interval: Some(interval),
                        payload: TimerPayload::Task {
                            cb: cb.clone(),
                            name: name.clone(),
                        },
                    });
                }
                _ => {}
            }
            due.push(entry.payload);
        }

        for entry in reinsert {
            inner.heap.push(entry);
        }
        if inner.heap.is_empty() {
            inner.cancelled.clear();
        }
        due
    }

    /// Empty the queue, returning every live payload. Shutdown path: the
    /// owner wakes coroutine payloads with a cancellation; task payloads
    /// are discarded with the queue.
    pub fn drain(&self) -> Vec<TimerPayload> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            if inner.cancelled.remove(&entry.seq) {
                continue;
            }
            out.push(entry.payload);
        }
        inner.cancelled.clear();
        out
    }

    /// Earliest live deadline, if any. Cancelled heads are discarded on
    /// the way so the poll timeout is not shortened for dead entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(head) = inner.heap.peek() {
            if inner.cancelled.contains(&head.seq) {
                let seq = head.seq;
                inner.heap.pop();
                inner.cancelled.remove(&seq);
                continue;
            }
            return Some(head.deadline);
        }
        None
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.heap.len() - inner.cancelled.len().min(inner.heap.len())
    }
}
