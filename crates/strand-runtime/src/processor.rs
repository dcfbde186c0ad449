//! Per-thread processor
//!
//! One processor per OS thread: a runnable FIFO of coroutines, an epoll
//! instance, a timer queue and an eventfd wakeup channel. All scheduling
//! state is thread-private and touched only on the owning thread; other
//! threads reach a processor exclusively through the mutex-guarded
//! pending buffer, the timer queue, the stop flag and the wakeup fd.
//!
//! When the runnable queue is empty the processor swaps into its internal
//! "epoll" coroutine, which drains expired timers, blocks in the kernel
//! for readiness, enqueues woken coroutines and yields back. A dedicated
//! "wake" coroutine keeps a hooked read parked on the eventfd so that
//! cross-thread notifications travel the ordinary readiness path.

use crate::config::RuntimeConfig;
use crate::coroutine::Coroutine;
use crate::fatal;
use crate::hook;
use crate::notify::WakeupFd;
use crate::poller::{Direction, Epoll};
use crate::timer::{TimerPayload, TimerQueue};
use crate::tls;

use strand_core::{CoState, NetError, SchedError, SchedResult, WakeReason};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Work submitted from another thread; becomes a coroutine on the owner.
struct Task {
    cb: Box<dyn FnOnce() + Send>,
    name: String,
}

pub struct Processor {
    // ── Cross-thread surface ──
    pending: Mutex<Vec<Task>>,
    timers: TimerQueue,
    wakeup: WakeupFd,
    stopped: AtomicBool,
    /// True while the epoll coroutine is blocked in the kernel.
    polling: AtomicBool,
    /// Number of live (non-terminated) coroutines owned here.
    load: AtomicUsize,
    /// pthread id of the thread running `run`; 0 before that.
    owner_thread: AtomicU64,

    // ── Owning-thread-only state ──
    runnable: RefCell<VecDeque<Rc<Coroutine>>>,
    idle: RefCell<Vec<Rc<Coroutine>>>,
    epoll: Epoll,

    stack_size: usize,
    epoll_timeout_ms: u64,
    tcp_no_delay: bool,
}

// SAFETY: the RefCell'd queues, the idle list and the epoll registry are
// only touched on the owning thread; every entry point into them asserts
// that. The remaining fields are Sync on their own.
unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

impl Processor {
    pub fn new(config: &RuntimeConfig) -> SchedResult<Arc<Self>> {
        let epoll = Epoll::new().map_err(SchedError::Setup)?;
        let wakeup = WakeupFd::new().map_err(SchedError::Setup)?;
        trace!("processor created");
        Ok(Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            timers: TimerQueue::new(),
            wakeup,
            stopped: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            load: AtomicUsize::new(0),
            owner_thread: AtomicU64::new(0),
            runnable: RefCell::new(VecDeque::new()),
            idle: RefCell::new(Vec::new()),
            epoll,
            stack_size: config.stack_size,
            epoll_timeout_ms: config.epoll_timeout_ms,
            tcp_no_delay: config.tcp_no_delay,
        }))
    }

    /// Whether sockets bound to this processor should set TCP_NODELAY.
    #[inline]
    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    /// True when the caller runs on this processor's thread.
    #[inline]
    pub fn is_owner_thread(&self) -> bool {
        let owner = self.owner_thread.load(Ordering::Relaxed);
        owner != 0 && owner == unsafe { libc::pthread_self() } as u64
    }

    /// Abort with a diagnostic unless called on the owning thread.
    /// Processor-owned objects in other crates build their misuse checks
    /// on this.
    pub fn assert_owner(&self, what: &str) {
        self.assert_in_owner_thread(what);
    }

    /// Number of live coroutines enqueued or running here.
    #[inline]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Request stop. The wakeup write makes the eventfd readable, so a
    /// kernel wait in progress (or about to start) returns immediately.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup.notify();
    }

    /// Enqueue a callback as a coroutine. Owning thread only; other
    /// threads go through [`Processor::add_pending`].
    pub fn add_task(&self, cb: Box<dyn FnOnce() + Send>, name: impl Into<String>) {
        self.assert_in_owner_thread("add_task");
        let name = name.into();
        let co = self.idle_or_new(cb, name);
        self.add_coroutine(co);
    }

    /// Enqueue a pre-built coroutine. Owning thread only.
    pub fn add_coroutine(&self, co: Rc<Coroutine>) {
        self.assert_in_owner_thread("add_coroutine");
        self.load.fetch_add(1, Ordering::Relaxed);
        debug!(
            co = co.id().raw(),
            name = %co.name(),
            load = self.load(),
            "task added"
        );
        self.runnable.borrow_mut().push_back(co);
    }

    /// Append work from another thread and kick the owner awake.
    pub fn add_pending(&self, cb: Box<dyn FnOnce() + Send>, name: impl Into<String>) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(Task {
                cb,
                name: name.into(),
            });
        }
        self.wakeup.notify();
    }

    /// Register `co` as the waiter for `dir` readiness on `fd`.
    /// Owning thread only; a second waiter per direction aborts.
    pub fn update_event(&self, fd: RawFd, dir: Direction, co: Rc<Coroutine>) {
        self.assert_in_owner_thread("update_event");
        self.epoll.add_waiter(fd, dir, co);
    }

    /// Drop one direction's waiter, keeping the fd registered.
    pub(crate) fn clear_waiter(&self, fd: RawFd, dir: Direction) {
        self.assert_in_owner_thread("clear_waiter");
        self.epoll.clear_waiter(fd, dir);
    }

    /// Deregister `fd` and resume every coroutine parked on it exactly
    /// once, with a cancellation wake. Call before closing the fd.
    pub fn remove_event(&self, fd: RawFd) {
        self.assert_in_owner_thread("remove_event");
        for co in self.epoll.remove(fd) {
            self.wake(&co, WakeReason::Cancelled);
        }
    }

    /// Schedule a timer on this processor's queue. Callable from any
    /// thread; an entry that becomes the new head shortens the current
    /// kernel wait through the wakeup fd.
    pub(crate) fn add_timer(
        &self,
        payload: TimerPayload,
        deadline: Instant,
        interval: Option<Duration>,
    ) -> u64 {
        let (seq, became_head) = self.timers.insert(payload, deadline, interval);
        if became_head {
            self.wakeup.notify();
        }
        seq
    }

    /// Cancel a timer by sequence number. Idempotent.
    pub(crate) fn cancel_timer(&self, seq: u64) {
        self.timers.cancel(seq);
    }

    /// Move a suspended coroutine back onto the runnable queue.
    ///
    /// Only a coroutine in `Hold` is woken; a second dispatcher racing on
    /// the same coroutine (readiness after its timeout already fired, or
    /// a cancelled timer) finds it `Ready` and backs off, so nothing is
    /// ever double-resumed.
    pub(crate) fn wake(&self, co: &Rc<Coroutine>, reason: WakeReason) {
        self.assert_in_owner_thread("wake");
        if co.state() != CoState::Hold {
            trace!(co = co.id().raw(), state = %co.state(), "wake skipped");
            return;
        }
        co.set_wake_reason(reason);
        co.set_state(CoState::Ready);
        self.runnable.borrow_mut().push_back(co.clone());
    }

    /// The thread's main loop. Consumes the thread until stop.
    pub fn run(self: Arc<Self>) {
        let tid = unsafe { libc::pthread_self() } as u64;
        if self.owner_thread.swap(tid, Ordering::SeqCst) != 0 {
            fatal!("processor run() entered twice");
        }
        tls::set_current_processor(self.clone());
        tls::set_hook_enabled(true);
        trace!("processor running");

        // Keep a hooked read parked on the eventfd so cross-thread
        // notifications are consumed through the readiness path.
        let wake_fd = self.wakeup.fd();
        let drainer = self.clone();
        self.add_task(
            Box::new(move || loop {
                if drainer.is_stopped() {
                    break;
                }
                let mut counter = [0u8; 8];
                match hook::read(wake_fd, &mut counter) {
                    Ok(_) => continue,
                    Err(NetError::Cancelled) => break,
                    Err(err) => {
                        tracing::error!("wakeup drain failed: {}", err);
                        break;
                    }
                }
            }),
            "wake",
        );

        let proc = self.clone();
        let epoll_co = Coroutine::new(
            Box::new(move || proc.poll_loop()),
            "epoll",
            self.stack_size,
        )
        .expect("processor: epoll coroutine setup failed");

        while !self.is_stopped() || !self.runnable.borrow().is_empty() {
            let next = self.runnable.borrow_mut().pop_front();
            let cur = next.unwrap_or_else(|| epoll_co.clone());
            cur.swap_in();
            self.retire_or_requeue(&cur, &epoll_co);
            self.drain_pending();
        }

        // The loop can exit while the epoll coroutine is suspended mid
        // round; give it a final turn so it cancels outstanding waiters,
        // then run whatever that woke.
        if !epoll_co.state().is_done() {
            epoll_co.swap_in();
        }
        loop {
            let next = self.runnable.borrow_mut().pop_front();
            let Some(cur) = next else { break };
            cur.swap_in();
            self.retire_or_requeue(&cur, &epoll_co);
            self.drain_pending();
        }

        tls::set_hook_enabled(false);
        tls::clear_current_processor();
        trace!("processor stopped");
    }

    /// Body of the internal epoll coroutine.
    fn poll_loop(&self) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 128];
        loop {
            self.dispatch_expired_timers();
            if self.is_stopped() {
                // Resume everything still parked, with a cancellation
                // wake, so blocked coroutines observe shutdown: first the
                // timer queue (sleepers, armed timeouts), then the epoll
                // registry. A coroutine parked in both is woken once; the
                // second dispatcher finds it Ready and backs off.
                for payload in self.timers.drain() {
                    if let TimerPayload::Resume(co) = payload {
                        self.wake(&co, WakeReason::Cancelled);
                    }
                }
                for co in self.epoll.drain_waiters() {
                    self.wake(&co, WakeReason::Cancelled);
                }
                break;
            }
            if !self.runnable.borrow().is_empty() {
                // Never await the kernel while runnable work exists.
                Coroutine::swap_out();
                continue;
            }

            let timeout = self.poll_timeout_ms();
            self.polling.store(true, Ordering::Release);
            let n = self.epoll.wait(timeout, &mut events);
            self.polling.store(false, Ordering::Release);

            // Resume in kernel-returned order; per fd the reader slot is
            // handed back before the writer slot.
            for ev in events.iter().take(n) {
                let fd = ev.u64 as RawFd;
                let (reader, writer) = self.epoll.take_ready(fd, ev.events);
                if let Some(co) = reader {
                    self.wake(&co, WakeReason::Readiness);
                }
                if let Some(co) = writer {
                    self.wake(&co, WakeReason::Readiness);
                }
            }
            self.dispatch_expired_timers();
            Coroutine::swap_out();
        }
    }

    fn retire_or_requeue(&self, cur: &Rc<Coroutine>, epoll_co: &Rc<Coroutine>) {
        match cur.state() {
            CoState::Term => {
                if !Rc::ptr_eq(cur, epoll_co) {
                    self.load.fetch_sub(1, Ordering::Relaxed);
                    trace!(co = cur.id().raw(), load = self.load(), "task finished");
                    self.idle.borrow_mut().push(cur.clone());
                }
            }
            CoState::Except => {
                if !Rc::ptr_eq(cur, epoll_co) {
                    self.load.fetch_sub(1, Ordering::Relaxed);
                    debug!(
                        co = cur.id().raw(),
                        name = %cur.name(),
                        "coroutine failed, shell retired"
                    );
                    // Not recycled: reset is only legal on Term shells.
                }
            }
            CoState::Ready => {
                // Explicit yield: back of the line.
                self.runnable.borrow_mut().push_back(cur.clone());
            }
            _ => {
                // Hold: parked in the epoll registry or a timer entry.
            }
        }
    }

    fn drain_pending(&self) {
        let tasks: Vec<Task> = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            self.add_task(task.cb, task.name);
        }
    }

    fn dispatch_expired_timers(&self) {
        for payload in self.timers.expired(Instant::now()) {
            match payload {
                TimerPayload::Task { cb, name } => {
                    self.add_task(Box::new(move || cb()), name);
                }
                TimerPayload::Resume(co) => {
                    self.wake(&co, WakeReason::Timer);
                }
            }
        }
    }

    fn idle_or_new(&self, cb: Box<dyn FnOnce() + Send>, name: String) -> Rc<Coroutine> {
        if let Some(shell) = self.idle.borrow_mut().pop() {
            shell.reset(cb, name);
            return shell;
        }
        Coroutine::new(cb, name, self.stack_size)
            .expect("processor: coroutine stack setup failed")
    }

    /// Kernel wait bound: the configured poll timeout, shortened to the
    /// next timer deadline.
    fn poll_timeout_ms(&self) -> i32 {
        let base = self.epoll_timeout_ms.min(i32::MAX as u64) as i32;
        match self.timers.next_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return 0;
                }
                // Round up a notch so the wait does not end a hair early.
                let ms = deadline.duration_since(now).as_millis() + 1;
                ms.min(base as u128) as i32
            }
            None => base,
        }
    }

    fn assert_in_owner_thread(&self, what: &str) {
        let owner = self.owner_thread.load(Ordering::Relaxed);
        let me = unsafe { libc::pthread_self() } as u64;
        if owner != me {
            fatal!(
                "{} called off the owning thread (owner {:#x}, current {:#x})",
                what,
                owner,
                me
            );
        }
    }
}
