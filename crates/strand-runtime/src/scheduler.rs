//! Scheduler: the owner of all processors
//!
//! Constructs one main processor (driven on the caller's thread) plus
//! n-1 worker threads, and is the external submission surface: `add_task`
//! and the timer entry points dispatch round-robin over the workers. The
//! main processor is excluded from the round-robin whenever workers
//! exist; in solo mode it takes everything.

use crate::config::RuntimeConfig;
use crate::processor::Processor;
use crate::timer::{TimerId, TimerPayload};
use crate::tls;

use strand_core::{SchedError, SchedResult};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

/// A SIGPIPE from a dead peer must surface as `EPIPE` on the write, not
/// kill the process. Done once, process-wide.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        use nix::sys::signal::{signal, SigHandler, Signal};
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.expect("ignore SIGPIPE");
        trace!("SIGPIPE ignored");
    });
}

struct Core {
    config: RuntimeConfig,
    /// Threads including the main one; frozen at start.
    threads: AtomicUsize,
    /// Index 0 is the main processor; immutable after start.
    procs: Mutex<Vec<Arc<Processor>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Round-robin cursor over the workers.
    rr: Mutex<usize>,
    running: AtomicBool,
    started: Mutex<bool>,
    started_cv: Condvar,
    quit: Mutex<bool>,
    quit_cv: Condvar,
}

impl Core {
    fn start(core: &Arc<Core>) -> SchedResult<()> {
        if core.running.swap(true, Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }
        let n = core.threads.load(Ordering::SeqCst);

        // Build every processor up front so a setup failure leaves no
        // half-started fleet behind.
        let mut built = Vec::with_capacity(n);
        for _ in 0..n {
            match Processor::new(&core.config) {
                Ok(proc) => built.push(proc),
                Err(err) => {
                    core.fail_start();
                    return Err(err);
                }
            }
        }
        let main = built[0].clone();
        *core.procs.lock().unwrap() = built.clone();

        for (i, proc) in built.into_iter().enumerate().skip(1) {
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{}", i))
                .spawn(move || proc.run());
            match handle {
                Ok(handle) => core.handles.lock().unwrap().push(handle),
                Err(err) => {
                    core.fail_start();
                    core.stop_processors();
                    return Err(SchedError::Setup(err));
                }
            }
        }

        debug!(threads = n, "scheduler running");
        core.signal_started();
        main.run();
        Ok(())
    }

    fn fail_start(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.signal_started();
    }

    fn signal_started(&self) {
        *self.started.lock().unwrap() = true;
        self.started_cv.notify_all();
    }

    fn stop_processors(&self) {
        for proc in self.procs.lock().unwrap().iter() {
            proc.stop();
        }
    }

    fn join_all(&self) {
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        *self.quit.lock().unwrap() = true;
        self.quit_cv.notify_all();
        debug!("scheduler joined");
    }
}

/// Stops the fleet when the last external `Scheduler` handle goes away.
/// Internal threads hold `Arc<Core>` only, so they do not keep this alive.
struct StopGuard {
    core: Arc<Core>,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        stop_core(&self.core);
    }
}

fn stop_core(core: &Arc<Core>) {
    if !core.running.swap(false, Ordering::SeqCst) {
        return;
    }
    core.stop_processors();

    if tls::is_hook_enabled() {
        // Called from a processor thread; joining inline would self-join.
        let core = core.clone();
        let _ = thread::Builder::new()
            .name("strand-join".into())
            .spawn(move || core.join_all());
    } else {
        core.join_all();
    }
}

/// Handle to the processor fleet. Cheap to clone; all clones drive the
/// same scheduler.
pub struct Scheduler {
    core: Arc<Core>,
    guard: Arc<StopGuard>,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Scheduler with configuration from the environment.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::from_env())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        ignore_sigpipe();
        config.validate().expect("invalid runtime configuration");
        let threads = config.threads;
        let core = Arc::new(Core {
            config,
            threads: AtomicUsize::new(threads),
            procs: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            rr: Mutex::new(0),
            running: AtomicBool::new(false),
            started: Mutex::new(false),
            started_cv: Condvar::new(),
            quit: Mutex::new(false),
            quit_cv: Condvar::new(),
        });
        Self {
            guard: Arc::new(StopGuard { core: core.clone() }),
            core,
        }
    }

    /// Set the thread count, main thread included. Pre-start only.
    pub fn set_worker_count(&self, n: usize) -> SchedResult<()> {
        if self.core.running.load(Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }
        if n == 0 {
            return Err(SchedError::InvalidWorkerCount(n));
        }
        self.core.threads.store(n, Ordering::SeqCst);
        Ok(())
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Start the fleet and drive the main processor on this thread.
    /// Returns only after `stop`.
    pub fn start(&self) -> SchedResult<()> {
        Core::start(&self.core)
    }

    /// Start on a new thread; blocks the caller until the fleet is ready.
    pub fn start_async(&self) -> SchedResult<()> {
        if self.core.running.load(Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }
        let core = self.core.clone();
        let handle = thread::Builder::new()
            .name("strand-sched".into())
            .spawn(move || {
                if let Err(err) = Core::start(&core) {
                    error!("scheduler start failed: {}", err);
                }
            })
            .map_err(SchedError::Setup)?;
        self.core.handles.lock().unwrap().push(handle);

        let mut started = self.core.started.lock().unwrap();
        while !*started {
            started = self.core.started_cv.wait(started).unwrap();
        }
        drop(started);

        if self.is_running() {
            Ok(())
        } else {
            Err(SchedError::NotRunning)
        }
    }

    /// Block until every processor thread has joined.
    pub fn wait(&self) {
        let mut quit = self.core.quit.lock().unwrap();
        while !*quit {
            quit = self.core.quit_cv.wait(quit).unwrap();
        }
    }

    /// Request stop on every processor, then join them. Invoked from a
    /// processor thread, the join runs on a detached helper so the caller
    /// does not join itself.
    pub fn stop(&self) {
        stop_core(&self.core);
    }

    /// Submit a task; lands on the next worker in round-robin order.
    pub fn add_task<F>(&self, f: F, name: impl Into<String>) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let proc = self.pick_processor()?;
        proc.add_pending(Box::new(f), name);
        Ok(())
    }

    /// Run `f` once at the absolute instant `when`.
    pub fn run_at<F>(&self, when: Instant, f: F, name: impl Into<String>) -> SchedResult<TimerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let proc = self.pick_processor()?;
        let seq = proc.add_timer(
            TimerPayload::Task {
                cb: Arc::new(f),
                name: name.into(),
            },
            when,
            None,
        );
        Ok(TimerId {
            owner: Arc::downgrade(&proc),
            seq,
        })
    }

    /// Run `f` once after `delay`.
    pub fn run_after<F>(
        &self,
        delay: Duration,
        f: F,
        name: impl Into<String>,
    ) -> SchedResult<TimerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.run_at(Instant::now() + delay, f, name)
    }

    /// Run `f` every `interval`, first firing one interval from now,
    /// until cancelled.
    pub fn run_every<F>(
        &self,
        interval: Duration,
        f: F,
        name: impl Into<String>,
    ) -> SchedResult<TimerId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let proc = self.pick_processor()?;
        let seq = proc.add_timer(
            TimerPayload::Task {
                cb: Arc::new(f),
                name: name.into(),
            },
            Instant::now() + interval,
            Some(interval),
        );
        Ok(TimerId {
            owner: Arc::downgrade(&proc),
            seq,
        })
    }

    /// Cancel a scheduled timer on whichever processor owns it.
    /// Idempotent; safe after expiry.
    pub fn cancel(&self, id: &TimerId) {
        if let Some(proc) = id.owner.upgrade() {
            proc.cancel_timer(id.seq);
        }
    }

    fn pick_processor(&self) -> SchedResult<Arc<Processor>> {
        if !self.is_running() {
            return Err(SchedError::NotRunning);
        }
        let procs = self.core.procs.lock().unwrap();
        if procs.is_empty() {
            return Err(SchedError::NotRunning);
        }
        if procs.len() == 1 {
            // Solo mode: the main processor takes everything.
            return Ok(procs[0].clone());
        }
        // Round-robin across the workers only; the main processor still
        // executes work added locally on its own thread.
        let workers = &procs[1..];
        let mut rr = self.core.rr.lock().unwrap();
        let proc = workers[*rr].clone();
        *rr = (*rr + 1) % workers.len();
        Ok(proc)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::mpsc;
    use std::thread::ThreadId;

    fn test_scheduler(threads: usize) -> Scheduler {
        let config = RuntimeConfig::new().threads(threads).epoll_timeout_ms(200);
        Scheduler::with_config(config)
    }

    #[test]
    fn fan_out_is_round_robin_and_ordered() {
        let sched = test_scheduler(4); // main + 3 workers
        sched.start_async().expect("start");

        let (tx, rx) = mpsc::channel::<(ThreadId, usize)>();
        for i in 0..300 {
            let tx = tx.clone();
            sched
                .add_task(
                    move || {
                        tx.send((std::thread::current().id(), i)).unwrap();
                    },
                    format!("fan-{}", i),
                )
                .expect("submit");
        }

        let mut per_thread: HashMap<ThreadId, Vec<usize>> = HashMap::new();
        for _ in 0..300 {
            let (tid, i) = rx.recv_timeout(Duration::from_secs(10)).expect("task ran");
            per_thread.entry(tid).or_default().push(i);
        }

        // Three workers, 100 tasks each, submission order kept per worker.
        assert_eq!(per_thread.len(), 3);
        for seq in per_thread.values() {
            assert_eq!(seq.len(), 100);
            assert!(seq.windows(2).all(|w| w[0] < w[1]));
        }

        sched.stop();
        sched.wait();
    }

    #[test]
    fn solo_mode_runs_tasks_on_the_main_processor() {
        let sched = test_scheduler(1);
        sched.start_async().expect("start");

        let (tx, rx) = mpsc::channel();
        sched
            .add_task(
                move || {
                    tx.send(std::thread::current().name().map(String::from))
                        .unwrap();
                },
                "solo",
            )
            .expect("submit");

        let name = rx.recv_timeout(Duration::from_secs(5)).expect("task ran");
        // The main processor runs on the scheduler's start thread.
        assert_eq!(name.as_deref(), Some("strand-sched"));

        sched.stop();
        sched.wait();
    }

    #[test]
    fn run_after_fires_once() {
        let sched = test_scheduler(2);
        sched.start_async().expect("start");

        let (tx, rx) = mpsc::channel();
        let t0 = Instant::now();
        sched
            .run_after(
                Duration::from_millis(80),
                move || {
                    tx.send(Instant::now()).unwrap();
                },
                "oneshot",
            )
            .expect("schedule");

        let fired = rx.recv_timeout(Duration::from_secs(5)).expect("fired");
        assert!(fired.duration_since(t0) >= Duration::from_millis(80));
        // One-shot: nothing else arrives.
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        sched.stop();
        sched.wait();
    }

    #[test]
    fn submission_after_stop_is_rejected() {
        let sched = test_scheduler(2);
        sched.start_async().expect("start");
        sched.stop();
        sched.wait();

        let err = sched.add_task(|| {}, "late").unwrap_err();
        assert!(matches!(err, SchedError::NotRunning));
    }

    #[test]
    fn set_worker_count_rejected_after_start() {
        let sched = test_scheduler(2);
        sched.start_async().expect("start");
        assert!(matches!(
            sched.set_worker_count(8),
            Err(SchedError::AlreadyStarted)
        ));
        assert!(matches!(
            sched.set_worker_count(0),
            Err(SchedError::AlreadyStarted)
        ));
        sched.stop();
        sched.wait();
    }

    #[test]
    fn double_start_is_rejected() {
        let sched = test_scheduler(2);
        sched.start_async().expect("start");
        assert!(matches!(
            sched.start_async(),
            Err(SchedError::AlreadyStarted)
        ));
        sched.stop();
        sched.wait();
    }
}
