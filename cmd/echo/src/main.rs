//! Echo server on the strand runtime
//!
//! One acceptor coroutine, one coroutine per connection, all multiplexed
//! over the configured thread count.
//!
//! ```sh
//! strand-echo 7000
//! # elsewhere:
//! nc 127.0.0.1 7000
//! ```

use anyhow::{Context, Result};
use strand::{spawn, RuntimeConfig, Scheduler, TcpListener};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "7000".to_string())
        .parse()
        .context("port must be a number")?;

    let sched = Scheduler::with_config(RuntimeConfig::from_env());
    sched.start_async().context("scheduler start")?;

    sched
        .add_task(
            move || {
                let addr = format!("0.0.0.0:{}", port).parse().unwrap();
                let listener = match TcpListener::bind(&addr) {
                    Ok(l) => l,
                    Err(err) => {
                        error!("bind {}: {}", addr, err);
                        return;
                    }
                };
                info!("echo listening on {}", listener.local_addr());

                loop {
                    match listener.accept() {
                        Ok(conn) => {
                            info!("{} connected from {}", conn.name(), conn.peer_addr());
                            let _ = spawn(
                                move || {
                                    let mut buf = [0u8; 4096];
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
                                    info!("{} done", conn.name());
                                },
                                "echo-conn",
                            );
                        }
                        Err(err) => {
                            error!("accept: {}", err);
                            break;
                        }
                    }
                }
            },
            "acceptor",
        )
        .context("submit acceptor")?;

    sched.wait();
    Ok(())
}
