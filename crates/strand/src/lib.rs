//! # strand — a stackful-coroutine TCP runtime
//!
//! Many logical connections multiplexed onto a small pool of OS threads.
//! Each thread pairs an epoll poller with a cooperative scheduler driving
//! stackful coroutines; `recv`, `send`, `sleep` and friends read as plain
//! blocking code but suspend only the calling coroutine.
//!
//! ## Quick start
//!
//! ```ignore
//! use strand::{Scheduler, TcpListener, spawn};
//!
//! fn main() {
//!     let sched = Scheduler::new();
//!     sched.start_async().unwrap();
//!
//!     sched.add_task(|| {
//!         let addr = "127.0.0.1:7000".parse().unwrap();
//!         let listener = TcpListener::bind(&addr).unwrap();
//!         loop {
//!             let conn = listener.accept().unwrap();
//!             spawn(move || {
//!                 let mut buf = [0u8; 4096];
//!                 while let Ok(n) = conn.recv(&mut buf) {
//!                     if n == 0 || conn.send(&buf[..n]).is_err() {
//!                         break;
//!                     }
//!                 }
//!             }, "echo-conn").unwrap();
//!         }
//!     }, "acceptor").unwrap();
//!
//!     sched.wait();
//! }
//! ```

use std::time::Duration;

pub use strand_core::{
    CoState, CoroutineId, NetError, NetResult, SchedError, SchedResult, WakeReason,
};
pub use strand_net::{Socket, TcpConnection, TcpListener};
pub use strand_runtime::{
    hook, tls, yield_now, Coroutine, Direction, Processor, RuntimeConfig, Scheduler, TimerId,
};

/// Spawn a coroutine on the current thread's processor.
///
/// Callable only from a processor thread (inside a task or coroutine);
/// use [`Scheduler::add_task`] to submit work from outside.
pub fn spawn<F>(f: F, name: &str) -> SchedResult<()>
where
    F: FnOnce() + Send + 'static,
{
    match tls::current_processor() {
        Some(proc) => {
            proc.add_task(Box::new(f), name);
            Ok(())
        }
        None => Err(SchedError::NotRunning),
    }
}

/// Suspend the current coroutine for `duration` without blocking its
/// thread. Outside a coroutine this is a plain thread sleep.
pub fn sleep(duration: Duration) {
    hook::sleep(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Instant;

    fn test_scheduler(threads: usize) -> Scheduler {
        let config = RuntimeConfig::new().threads(threads).epoll_timeout_ms(200);
        Scheduler::with_config(config)
    }

    #[test]
    fn timed_recv_expires_and_keeps_the_connection() {
        // Peer accepts and stays silent forever.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let peer = std::thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            let _ = hold_rx.recv(); // keep the socket open until told
        });

        let sched = test_scheduler(2);
        sched.start_async().expect("start");

        let (tx, rx) = mpsc::channel();
        sched
            .add_task(
                move || {
                    let conn = TcpConnection::connect(&addr, "silent-peer").expect("connect");
                    conn.set_recv_timeout(Duration::from_millis(500)).unwrap();

                    let t0 = Instant::now();
                    let mut buf = [0u8; 16];
                    let result = conn.recv(&mut buf);
                    tx.send((t0.elapsed(), matches!(result, Err(NetError::TimedOut))))
                        .unwrap();
                },
                "timed-recv",
            )
            .expect("submit");

        let (waited, timed_out) = rx.recv_timeout(Duration::from_secs(5)).expect("finished");
        assert!(timed_out);
        assert!(waited >= Duration::from_millis(500));
        assert!(waited <= Duration::from_millis(650), "waited {:?}", waited);

        hold_tx.send(()).ok();
        peer.join().unwrap();
        sched.stop();
        sched.wait();
    }

    #[test]
    fn periodic_timer_stops_at_cancellation() {
        let sched = test_scheduler(2);
        sched.start_async().expect("start");

        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let id = sched
            .run_every(
                Duration::from_millis(100),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                "ticker",
            )
            .expect("schedule");

        // Cancel right after the third firing.
        let t0 = Instant::now();
        while fired.load(Ordering::SeqCst) < 3 {
            assert!(t0.elapsed() < Duration::from_secs(5), "ticker too slow");
            std::thread::sleep(Duration::from_millis(5));
        }
        sched.cancel(&id);
        // Cancelling again is a no-op.
        sched.cancel(&id);

        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        sched.stop();
        sched.wait();
    }

    #[test]
    fn stop_resumes_a_coroutine_blocked_in_recv() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (hold_tx, hold_rx) = mpsc::channel::<()>();
        let peer = std::thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            let _ = hold_rx.recv();
        });

        let sched = test_scheduler(2);
        sched.start_async().expect("start");

        let (tx, rx) = mpsc::channel();
        sched
            .add_task(
                move || {
                    let conn = TcpConnection::connect(&addr, "blocked").expect("connect");
                    // No timeout: parked until shutdown cancels the wait.
                    let mut buf = [0u8; 16];
                    let result = conn.recv(&mut buf);
                    tx.send(matches!(result, Err(NetError::Cancelled))).unwrap();
                },
                "blocked-recv",
            )
            .expect("submit");

        // Let the coroutine park in recv first.
        std::thread::sleep(Duration::from_millis(150));

        let t0 = Instant::now();
        sched.stop();
        sched.wait();

        // The blocked coroutine observed the cancellation during
        // shutdown, and the fleet came down within a poll timeout.
        assert!(rx.recv_timeout(Duration::from_secs(1)).expect("resumed"));
        assert!(t0.elapsed() < Duration::from_secs(2));

        hold_tx.send(()).ok();
        peer.join().unwrap();
    }

    #[test]
    fn echo_server_over_the_scheduler() {
        let sched = test_scheduler(2);
        sched.start_async().expect("start");

        let (addr_tx, addr_rx) = mpsc::channel();
        sched
            .add_task(
                move || {
                    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
                    let listener = TcpListener::bind(&bind).expect("bind");
                    addr_tx.send(listener.local_addr()).unwrap();

                    // Serve a fixed number of connections, one coroutine
                    // each, all on this processor.
                    for _ in 0..3 {
                        let conn = listener.accept().expect("accept");
                        spawn(
                            move || {
                                let mut buf = [0u8; 256];
                                loop {
                                    match conn.recv(&mut buf) {
                                        Ok(0) | Err(_) => break,
                                        Ok(n) => {
                                            if conn.send(&buf[..n]).is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            },
                            "echo-conn",
                        )
                        .expect("spawn");
                    }
                },
                "acceptor",
            )
            .expect("submit");

        let addr = addr_rx.recv_timeout(Duration::from_secs(5)).expect("bound");

        use std::io::{Read, Write};
        let mut clients: Vec<std::net::TcpStream> = (0..3)
            .map(|_| std::net::TcpStream::connect(addr).unwrap())
            .collect();
        for (i, client) in clients.iter_mut().enumerate() {
            let msg = format!("ping-{}", i);
            client.write_all(msg.as_bytes()).unwrap();
            let mut buf = [0u8; 256];
            let n = client.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], msg.as_bytes());
        }
        drop(clients);

        sched.stop();
        sched.wait();
    }

    #[test]
    fn coroutine_sleep_overlaps_across_tasks() {
        let sched = test_scheduler(2);
        sched.start_async().expect("start");

        let (tx, rx) = mpsc::channel();
        let t0 = Instant::now();
        for i in 0..4 {
            let tx = tx.clone();
            sched
                .add_task(
                    move || {
                        sleep(Duration::from_millis(150));
                        tx.send(i).unwrap();
                    },
                    format!("sleeper-{}", i),
                )
                .expect("submit");
        }

        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(5)).expect("woke");
        }
        // Four 150ms sleeps across one worker must overlap, not serialize.
        assert!(t0.elapsed() < Duration::from_millis(450));

        sched.stop();
        sched.wait();
    }
}
