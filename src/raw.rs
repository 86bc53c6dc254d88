//! Low-level socket operations and platform abstractions
//!
//! This module wraps the POSIX socket calls the rest of the crate is built
//! on: socket creation, address conversion in both directions, non-blocking
//! mode, bind/listen/connect, raw `recv`/`send`, shutdown and the socket
//! options applied by [`crate::config`]. Every wrapper returns
//! `io::Result`, translating a negative return into
//! `io::Error::last_os_error()`.
//!
//! # Key Abstractions
//!
//! - **Domain**: IP protocol family (IPv4 vs IPv6)
//! - **SockAddr**: platform representation of a socket address
//! - **OsSocket**: the raw file descriptor handed to the readiness
//!   backends
//!
//! # Safety
//!
//! This module contains `unsafe` code for raw system calls and for the
//! memory layout of socket addresses. All `unsafe` operations are
//! encapsulated behind safe interfaces; the only precondition callers must
//! uphold is that a descriptor passed in is open and of the right kind.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};

/// Raw descriptor type used throughout the crate.
pub type OsSocket = RawFd;

/// IP protocol domain for sockets
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    /// IPv4 protocol
    Ipv4,
    /// IPv6 protocol
    Ipv6,
}

/// Platform-specific socket address storage
#[derive(Debug)]
pub enum SockAddr {
    /// IPv4 socket address
    V4(libc::sockaddr_in),
    /// IPv6 socket address
    V6(libc::sockaddr_in6),
}

/// Convert a `SocketAddr` to its platform representation.
pub fn to_sockaddr(addr: SocketAddr) -> (Domain, SockAddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let mut s: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            s.sin_family = libc::AF_INET as _;
            s.sin_port = a.port().to_be();
            s.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()).to_be(),
            };
            (
                Domain::Ipv4,
                SockAddr::V4(s),
                std::mem::size_of::<libc::sockaddr_in>() as _,
            )
        }
        SocketAddr::V6(a) => {
            let mut s: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            s.sin6_family = libc::AF_INET6 as _;
            s.sin6_port = a.port().to_be();
            s.sin6_flowinfo = a.flowinfo();
            s.sin6_scope_id = a.scope_id();
            s.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            (
                Domain::Ipv6,
                SockAddr::V6(s),
                std::mem::size_of::<libc::sockaddr_in6>() as _,
            )
        }
    }
}

/// Decode a kernel-filled `sockaddr_storage` back into a `SocketAddr`.
pub fn from_sockaddr(ss: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(ss as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(ss as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {other}"),
        )),
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        /// Create a new TCP stream socket with close-on-exec set.
        pub fn socket_stream(domain: Domain) -> io::Result<OsSocket> {
            let d = match domain {
                Domain::Ipv4 => libc::AF_INET,
                Domain::Ipv6 => libc::AF_INET6,
            };
            let fd = unsafe { libc::socket(d, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            unsafe {
                if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) != 0 {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err);
                }
            }
            // Sends report EPIPE instead of raising SIGPIPE.
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
            Ok(fd)
        }
    } else {
        /// Create a new TCP stream socket with close-on-exec set.
        pub fn socket_stream(domain: Domain) -> io::Result<OsSocket> {
            let d = match domain {
                Domain::Ipv4 => libc::AF_INET,
                Domain::Ipv6 => libc::AF_INET6,
            };
            let fd = unsafe {
                libc::socket(d, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, libc::IPPROTO_TCP)
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(fd)
        }
    }
}

/// Set socket non-blocking mode
pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(os, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let nb = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(os, libc::F_SETFL, nb) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Raw bind operation for socket to address
pub unsafe fn bind_raw(os: OsSocket, sa: &SockAddr, len: libc::socklen_t) -> io::Result<()> {
    let ptr = match sa {
        SockAddr::V4(s) => s as *const _ as *const libc::sockaddr,
        SockAddr::V6(s) => s as *const _ as *const libc::sockaddr,
    };
    if unsafe { libc::bind(os, ptr, len) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Start listening on socket with specified backlog
pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(os, backlog) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Initiate a non-blocking connect.
///
/// Returns `Ok(true)` when the connection completed immediately (loopback
/// does this), `Ok(false)` when the handshake is in flight (`EINPROGRESS`)
/// and the caller should wait for write-readiness, and `Err` otherwise.
pub fn connect_raw(os: OsSocket, sa: &SockAddr, len: libc::socklen_t) -> io::Result<bool> {
    let ptr = match sa {
        SockAddr::V4(s) => s as *const _ as *const libc::sockaddr,
        SockAddr::V6(s) => s as *const _ as *const libc::sockaddr,
    };
    if unsafe { libc::connect(os, ptr, len) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok(false),
        _ => Err(err),
    }
}

/// Non-blocking receive into `buf`. `Ok(0)` means the peer closed.
pub fn recv(os: OsSocket, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(os, buf.as_mut_ptr() as _, buf.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Non-blocking send of `buf`, returning the number of bytes the kernel
/// accepted. SIGPIPE is suppressed where the platform allows it.
pub fn send(os: OsSocket, buf: &[u8]) -> io::Result<usize> {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let flags = 0; // SO_NOSIGPIPE was set at creation
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let flags = libc::MSG_NOSIGNAL;
    let n = unsafe { libc::send(os, buf.as_ptr() as _, buf.len(), flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Shut down both directions of a connected socket.
pub fn shutdown_both(os: OsSocket) -> io::Result<()> {
    if unsafe { libc::shutdown(os, libc::SHUT_RDWR) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fetch and clear the pending socket error (`SO_ERROR`).
///
/// Used after a non-blocking connect reports write-readiness to learn
/// whether the handshake actually succeeded.
pub fn take_socket_error(os: OsSocket) -> io::Result<Option<io::Error>> {
    let mut val: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            os,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut val as *mut _ as _,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if val == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(val)))
    }
}

/// Local address of a bound socket.
pub fn local_addr(os: OsSocket) -> io::Result<SocketAddr> {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(os, &mut ss as *mut _ as _, &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&ss)
}

/// Remote address of a connected socket.
pub fn peer_addr(os: OsSocket) -> io::Result<SocketAddr> {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getpeername(os, &mut ss as *mut _ as _, &mut len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&ss)
}

/// Set socket receive buffer size
pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> {
    setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz)
}
/// Set socket send buffer size
pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> {
    setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz)
}
/// Allow rebinding a recently used local address
pub fn set_reuse_addr(os: OsSocket, on: bool) -> io::Result<()> {
    setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32)
}
/// Enable port reuse for multiple binds (Linux/BSD)
pub fn set_reuse_port(os: OsSocket, on: bool) -> io::Result<()> {
    setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as i32)
}
/// Disable TCP Nagle algorithm for low latency
pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> {
    setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32)
}
cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Enable TCP quick ACK for low latency
        pub fn set_tcp_quickack(os: OsSocket, on: bool) -> io::Result<()> {
            setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_QUICKACK, on as i32)
        }
    } else {
        /// Enable TCP quick ACK for low latency (no-op on this platform)
        pub fn set_tcp_quickack(_os: OsSocket, _on: bool) -> io::Result<()> {
            Ok(())
        }
    }
}
/// Configure IPv6-only mode (disable dual-stack)
pub fn set_ipv6_only(os: OsSocket, only: bool) -> io::Result<()> {
    setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, only as i32)
}

fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
    let v = val as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &v as *const _ as _,
            std::mem::size_of::<libc::c_int>() as _,
        )
    };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        /// Create a non-blocking, close-on-exec pipe pair `(read, write)`.
        ///
        /// Used by the poll(2) backend as its wakeup primitive and by
        /// tests as a cheap readiness fixture.
        pub fn pipe_nonblocking() -> io::Result<(RawFd, RawFd)> {
            let mut fds = [0 as RawFd; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                unsafe {
                    if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) != 0
                        || libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) != 0
                    {
                        let err = io::Error::last_os_error();
                        libc::close(fds[0]);
                        libc::close(fds[1]);
                        return Err(err);
                    }
                }
            }
            Ok((fds[0], fds[1]))
        }
    } else {
        /// Create a non-blocking, close-on-exec pipe pair `(read, write)`.
        ///
        /// Used by the poll(2) backend as its wakeup primitive and by
        /// tests as a cheap readiness fixture.
        pub fn pipe_nonblocking() -> io::Result<(RawFd, RawFd)> {
            let mut fds = [0 as RawFd; 2];
            if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok((fds[0], fds[1]))
        }
    }
}

/// Close a raw descriptor, ignoring errors.
pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Convert OS socket to std TCP listener
pub unsafe fn tcp_listener_from_os(fd: OsSocket) -> std::net::TcpListener {
    unsafe { std::net::TcpListener::from_raw_fd(fd) }
}
/// Convert OS socket to std TCP stream
pub unsafe fn tcp_stream_from_os(fd: OsSocket) -> std::net::TcpStream {
    unsafe { std::net::TcpStream::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let (domain, sa, _len) = to_sockaddr(addr);
        assert_eq!(domain, Domain::Ipv4);
        let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        if let SockAddr::V4(sin) = sa {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut ss as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
        }
        assert_eq!(from_sockaddr(&ss).unwrap(), addr);
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9000".parse().unwrap();
        let (domain, sa, _len) = to_sockaddr(addr);
        assert_eq!(domain, Domain::Ipv6);
        let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        if let SockAddr::V6(sin6) = sa {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut ss as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
        }
        assert_eq!(from_sockaddr(&ss).unwrap(), addr);
    }

    #[test]
    fn pipe_is_nonblocking() {
        let (r, w) = pipe_nonblocking().unwrap();
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as _, buf.len()) };
        assert!(n < 0);
        assert_eq!(
            io::Error::last_os_error().kind(),
            io::ErrorKind::WouldBlock
        );
        close(r);
        close(w);
    }
}
