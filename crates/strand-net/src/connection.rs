//! Coroutine-facing TCP connection
//!
//! `recv` and `send` read as linear blocking code; underneath, the hook
//! layer parks the calling coroutine on readiness. A connection is bound
//! to the processor whose thread created it. Peer closure flips the quit
//! flag: the EOF (or error) is delivered once, and every later operation
//! fails fast with `PeerClosed`.

use crate::socket::Socket;

use strand_core::{NetError, NetResult};
use strand_runtime::{hook, tls, Processor};

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

pub struct TcpConnection {
    proc: Arc<Processor>,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    name: String,
    quit: Cell<bool>,
}

impl TcpConnection {
    pub(crate) fn from_socket(
        proc: Arc<Processor>,
        socket: Socket,
        name: String,
    ) -> NetResult<Self> {
        let local_addr = socket.local_addr().map_err(NetError::Io)?;
        let peer_addr = socket.peer_addr().map_err(NetError::Io)?;
        debug!(
            name = %name,
            fd = socket.fd(),
            %local_addr,
            %peer_addr,
            "connection up"
        );
        Ok(Self {
            proc,
            socket,
            local_addr,
            peer_addr,
            name,
            quit: Cell::new(false),
        })
    }

    /// Establish an outbound connection, suspending the current coroutine
    /// through the TCP handshake.
    pub fn connect(addr: &SocketAddr, name: impl Into<String>) -> NetResult<Self> {
        let Some(proc) = tls::current_processor() else {
            return Err(NetError::Io(io::Error::new(
                io::ErrorKind::Other,
                "no processor on this thread",
            )));
        };
        let socket = Socket::stream_for(addr).map_err(NetError::Io)?;
        hook::connect(socket.fd(), addr)?;
        socket.set_keep_alive(true).map_err(NetError::Io)?;
        if proc.tcp_no_delay() {
            socket.set_tcp_no_delay(true).map_err(NetError::Io)?;
        }
        Self::from_socket(proc, socket, name.into())
    }

    /// Receive into `buf`, suspending until data, EOF, deadline or error.
    ///
    /// `Ok(0)` means the peer closed; the connection is marked quit and
    /// later calls fail with `PeerClosed`. A timeout leaves the
    /// connection usable.
    pub fn recv(&self, buf: &mut [u8]) -> NetResult<usize> {
        self.proc.assert_owner("TcpConnection::recv");
        if self.quit.get() {
            return Err(NetError::PeerClosed);
        }
        match hook::read(self.socket.fd(), buf) {
            Ok(0) => {
                trace!(name = %self.name, "peer closed");
                self.quit.set(true);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(NetError::TimedOut) => Err(NetError::TimedOut),
            Err(err) => {
                self.quit.set(true);
                Err(err)
            }
        }
    }

    /// Send all of `buf`, suspending between partial writes.
    pub fn send(&self, buf: &[u8]) -> NetResult<()> {
        self.proc.assert_owner("TcpConnection::send");
        if self.quit.get() {
            return Err(NetError::PeerClosed);
        }
        match hook::write_all(self.socket.fd(), buf) {
            Ok(()) => Ok(()),
            Err(NetError::TimedOut) => Err(NetError::TimedOut),
            Err(err) => {
                self.quit.set(true);
                Err(err)
            }
        }
    }

    /// Half-close the write side; the peer reads EOF.
    pub fn shutdown(&self) -> NetResult<()> {
        self.proc.assert_owner("TcpConnection::shutdown");
        self.socket.shutdown_write().map_err(NetError::Io)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> NetResult<()> {
        self.socket.set_tcp_no_delay(on).map_err(NetError::Io)
    }

    /// Deadline applied to suspended receives.
    pub fn set_recv_timeout(&self, timeout: Duration) -> NetResult<()> {
        self.socket.set_recv_timeout(timeout).map_err(NetError::Io)
    }

    /// Deadline applied to suspended sends.
    pub fn set_send_timeout(&self, timeout: Duration) -> NetResult<()> {
        self.socket.set_send_timeout(timeout).map_err(NetError::Io)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        !self.quit.get()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        // Deregister before the fd closes so parked waiters are resumed
        // exactly once with a cancellation wake.
        if self.proc.is_owner_thread() {
            self.proc.remove_event(self.socket.fd());
        }
        debug!(name = %self.name, "connection down");
    }
}
