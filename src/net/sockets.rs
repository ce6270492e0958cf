//! Raw non-blocking socket syscall wrappers used by Acceptor, Connector and
//! TcpConnection.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::net::inet_address::InetAddress;
use crate::sys::syscall;

pub fn create_nonblocking(family: libc::c_int) -> io::Result<OwnedFd> {
    let fd = syscall!(socket(
        family,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        libc::IPPROTO_TCP,
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

fn set_sockopt_bool(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
}

pub fn bind(fd: RawFd, addr: &InetAddress) -> io::Result<()> {
    let (storage, len) = addr.to_raw();
    syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))?;
    Ok(())
}

pub fn listen(fd: RawFd) -> io::Result<()> {
    syscall!(listen(fd, libc::SOMAXCONN))?;
    Ok(())
}

/// Accepts a connection, returning the new non-blocking/cloexec fd and the
/// peer address. `EAGAIN`/`ECONNABORTED`/`EINTR`/`EPROTO`/`EPERM`/`EMFILE`
/// are expected transient conditions callers retry or skip on; everything
/// else is a logged, unexpected failure.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, InetAddress)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let connfd = syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    let peer = InetAddress::from_raw(&storage);
    Ok((unsafe { OwnedFd::from_raw_fd(connfd) }, peer))
}

/// Starts a non-blocking connect; the caller classifies the resulting
/// `io::Error`'s raw OS error against the Connector's errno taxonomy.
pub fn connect(fd: RawFd, addr: &InetAddress) -> io::Result<()> {
    let (storage, len) = addr.to_raw();
    syscall!(connect(fd, &storage as *const _ as *const libc::sockaddr, len))?;
    Ok(())
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR))?;
    Ok(())
}

pub fn get_socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    Ok(err)
}

pub fn local_addr(fd: RawFd) -> io::Result<InetAddress> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    Ok(InetAddress::from_raw(&storage))
}

pub fn peer_addr(fd: RawFd) -> io::Result<InetAddress> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    Ok(InetAddress::from_raw(&storage))
}

/// True if the socket's local endpoint equals its peer endpoint: the
/// pathological self-connect case a non-blocking connect can land on.
pub fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local.socket_addr() == peer.socket_addr(),
        _ => false,
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(read(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len()
    ))?;
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len()
    ))?;
    Ok(n as usize)
}

pub fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}
