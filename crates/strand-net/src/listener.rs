//! Coroutine-facing TCP acceptor
//!
//! The primitive the server glue is built on: `accept` suspends the
//! calling coroutine until a connection is pending and hands back a
//! [`TcpConnection`] bound to the same processor.

use crate::connection::TcpConnection;
use crate::socket::Socket;

use strand_core::{NetError, NetResult};
use strand_runtime::{hook, tls, Processor};

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

pub struct TcpListener {
    proc: Arc<Processor>,
    socket: Socket,
    local_addr: SocketAddr,
    accepted: Cell<u64>,
}

impl TcpListener {
    /// Bind and listen on `addr` from the current processor's thread.
    pub fn bind(addr: &SocketAddr) -> NetResult<Self> {
        let Some(proc) = tls::current_processor() else {
            return Err(NetError::Io(io::Error::new(
                io::ErrorKind::Other,
                "no processor on this thread",
            )));
        };
        let socket = Socket::stream_for(addr).map_err(NetError::Io)?;
        socket.set_reuse_addr(true).map_err(NetError::Io)?;
        socket.bind(addr).map_err(NetError::Io)?;
        socket.listen(1024).map_err(NetError::Io)?;
        let local_addr = socket.local_addr().map_err(NetError::Io)?;
        trace!(%local_addr, "listener bound");
        Ok(Self {
            proc,
            socket,
            local_addr,
            accepted: Cell::new(0),
        })
    }

    /// Accept one connection, suspending until a client arrives. The
    /// accepted socket comes back keep-alive, non-blocking, and NODELAY
    /// per configuration.
    pub fn accept(&self) -> NetResult<TcpConnection> {
        self.proc.assert_owner("TcpListener::accept");
        let fd = hook::accept(self.socket.fd())?;
        let socket = Socket::from_raw(fd);
        socket.set_keep_alive(true).map_err(NetError::Io)?;
        if self.proc.tcp_no_delay() {
            socket.set_tcp_no_delay(true).map_err(NetError::Io)?;
        }

        let n = self.accepted.get() + 1;
        self.accepted.set(n);
        let name = format!("conn-{}#{}", self.local_addr.port(), n);
        TcpConnection::from_socket(self.proc.clone(), socket, name)
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if self.proc.is_owner_thread() {
            self.proc.remove_event(self.socket.fd());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_runtime::RuntimeConfig;
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn accepts_and_names_connections() {
        let config = RuntimeConfig::new().epoll_timeout_ms(200);
        let proc = Processor::new(&config).expect("processor");
        let runner = proc.clone();
        let handle = std::thread::spawn(move || runner.run());

        let (addr_tx, addr_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel();
        proc.add_pending(
            Box::new(move || {
                let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
                let listener = TcpListener::bind(&bind).expect("bind");
                addr_tx.send(listener.local_addr()).unwrap();

                for _ in 0..2 {
                    let conn = listener.accept().expect("accept");
                    let mut buf = [0u8; 32];
                    let n = conn.recv(&mut buf).expect("recv");
                    conn.send(&buf[..n]).expect("send");
                    tx.send(conn.name().to_string()).unwrap();
                }
            }),
            "acceptor",
        );

        let addr = addr_rx.recv_timeout(Duration::from_secs(5)).expect("bound");
        for i in 0..2 {
            let mut client = std::net::TcpStream::connect(addr).unwrap();
            client.write_all(format!("msg-{}", i).as_bytes()).unwrap();
            let mut buf = [0u8; 32];
            let n = client.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], format!("msg-{}", i).as_bytes());
        }

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("conn-"));

        proc.stop();
        handle.join().unwrap();
    }
}
