//! RAII socket wrapper
//!
//! Thin typed layer over the libc socket calls the runtime needs. Every
//! socket is created non-blocking and close-on-exec; blocking behavior
//! comes from the hook layer, never from the descriptor.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// New non-blocking TCP socket for the address family of `addr`.
    pub fn stream_for(addr: &SocketAddr) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Adopt an already-open descriptor (an accepted connection).
    /// Takes ownership: the fd is closed on drop.
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_encode(addr);
        let ret = unsafe {
            libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let ret = unsafe { libc::listen(self.fd, backlog) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    /// `SO_RCVTIMEO`: the hook layer reads this back as the deadline for
    /// suspended receives.
    pub fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(libc::SO_RCVTIMEO, timeout)
    }

    /// `SO_SNDTIMEO`: likewise for suspended sends.
    pub fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(libc::SO_SNDTIMEO, timeout)
    }

    /// Half-close the write side; the peer reads EOF.
    pub fn shutdown_write(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.fd, libc::SHUT_WR) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sockname(libc::getsockname)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sockname(libc::getpeername)
    }

    fn set_opt(&self, level: libc::c_int, opt: libc::c_int, val: libc::c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                opt,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_timeout(&self, opt: libc::c_int, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                opt,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn sockname(
        &self,
        get: unsafe extern "C" fn(
            libc::c_int,
            *mut libc::sockaddr,
            *mut libc::socklen_t,
        ) -> libc::c_int,
    ) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe { get(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_decode(&storage)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub(crate) fn sockaddr_encode(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub(crate) fn sockaddr_decode(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_v4() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn bind_and_report_local_addr() {
        let sock = Socket::stream_for(&any_v4()).expect("socket");
        sock.set_reuse_addr(true).expect("reuseaddr");
        sock.bind(&any_v4()).expect("bind");
        sock.listen(16).expect("listen");

        let addr = sock.local_addr().expect("local addr");
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn options_apply_cleanly() {
        let sock = Socket::stream_for(&any_v4()).expect("socket");
        sock.set_keep_alive(true).expect("keepalive");
        sock.set_tcp_no_delay(true).expect("nodelay");
        sock.set_recv_timeout(Duration::from_millis(500))
            .expect("rcvtimeo");
        sock.set_send_timeout(Duration::from_millis(500))
            .expect("sndtimeo");
    }

    #[test]
    fn encode_decode_round_trip() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let (storage, _) = sockaddr_encode(&addr);
        assert_eq!(sockaddr_decode(&storage).unwrap(), addr);

        let addr6: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        let (storage6, _) = sockaddr_encode(&addr6);
        assert_eq!(sockaddr_decode(&storage6).unwrap(), addr6);
    }
}
