//! Thin wrappers around the raw socket syscalls the event loop needs
//! opening upstream UDP/TCP sockets, flipping
//! blocking mode, non-blocking `connect`, and the `send`/`recv` calls
//! used once a socket is ready. Kept as free functions over a bare
//! `RawFd` rather than wrapping `std::net`'s owned socket types, since
//! flow sockets are stored in the session tables as plain `RawFd` and
//! closed explicitly by the sweeper/teardown path, not by `Drop`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

fn domain_for(version: u8) -> Domain {
    if version == 4 {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Opens a blocking datagram socket of the matching address family.
pub fn open_udp(version: u8) -> io::Result<RawFd> {
    let sock = Socket::new(domain_for(version), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(false)?;
    Ok(sock.into_raw_fd())
}

/// Opens a non-blocking stream socket (left non-blocking until
/// connect completes).
pub fn open_tcp_nonblocking(version: u8) -> io::Result<RawFd> {
    let sock = Socket::new(domain_for(version), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    Ok(sock.into_raw_fd())
}

/// Enables `SO_BROADCAST` on an already-open socket, for datagrams to
/// the IPv4 broadcast address.
pub fn set_broadcast(fd: RawFd) -> io::Result<()> {
    with_borrowed(fd, |sock| sock.set_broadcast(true))
}

/// Flips a socket back to blocking mode once its non-blocking `connect`
/// has completed.
pub fn set_blocking(fd: RawFd, blocking: bool) -> io::Result<()> {
    with_borrowed(fd, |sock| sock.set_nonblocking(!blocking))
}

/// Runs `f` against `fd` through a `Socket` that is forgotten afterwards,
/// so the caller keeps sole ownership of the descriptor.
fn with_borrowed<T>(fd: RawFd, f: impl FnOnce(&Socket) -> io::Result<T>) -> io::Result<T> {
    let sock = unsafe { Socket::from_raw_fd(fd) };
    let result = f(&sock);
    std::mem::forget(sock);
    result
}

/// Starts a non-blocking `connect`. `EINPROGRESS` is the expected,
/// non-error outcome; the event loop observes completion via
/// writability.
pub fn connect_nonblocking(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let sock_addr = SockAddr::from(addr);
    let ret = unsafe { libc::connect(fd, sock_addr.as_ptr(), sock_addr.len()) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Reads `SO_ERROR` to learn whether a non-blocking `connect` that just
/// became writable actually succeeded.
pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

pub fn send_to(fd: RawFd, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
    let sock_addr = SockAddr::from(addr);
    let n = unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            0,
            sock_addr.as_ptr(),
            sock_addr.len(),
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Sends payload on an established TCP flow's upstream socket. `more`
/// requests `MSG_MORE` (deferring the final segment until PSH is set).
pub fn send(fd: RawFd, data: &[u8], more: bool) -> io::Result<usize> {
    let flags = if more { libc::MSG_MORE } else { 0 };
    let n = unsafe { libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), flags) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn close(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Raw `read`/`write` on the TUN descriptor, which the engine neither
/// owns as a `std::fs::File` nor closes (already opened by the host).
pub fn tun_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub fn tun_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}
