//! Thin syscall wrappers shared by the poller, timer and socket layers.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

/// Runs a libc call and turns a `-1` return into `io::Error::last_os_error()`.
macro_rules! syscall {
    ($fn:ident($($arg:expr),* $(,)*)) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

/// Sets `FD_CLOEXEC` and `O_NONBLOCK` on an already-open descriptor.
pub(crate) fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    Ok(())
}

/// A non-blocking `eventfd(2)`-backed wakeup descriptor, used by the loop
/// to force a prompt return from the blocking poller wait.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: std::os::fd::OwnedFd,
}

impl EventFd {
    pub(crate) fn new() -> io::Result<EventFd> {
        let raw = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
        let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) };
        Ok(EventFd { fd })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let buf = one.to_ne_bytes();
        match syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Consumes the pending counter. Called after the wakeup fd is reported
    /// readable; ignores `WouldBlock` since another thread may have already
    /// drained it.
    pub(crate) fn drain(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

use std::os::fd::FromRawFd;

/// A `timerfd_create(2)`-backed monotonic timer descriptor.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: std::os::fd::OwnedFd,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let raw = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
        ))?;
        let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) };
        Ok(TimerFd { fd })
    }

    /// Arms the timer to fire once at `micros_from_now` (clamped to a
    /// minimum of 100 microseconds to avoid an immediate-fire race).
    pub(crate) fn arm(&self, micros_from_now: i64) -> io::Result<()> {
        let micros = micros_from_now.max(100);
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: micros / 1_000_000,
                tv_nsec: (micros % 1_000_000) * 1_000,
            },
        };
        syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut()
        ))?;
        Ok(())
    }

    /// Reads and discards the expiry counter. Ignores `WouldBlock`.
    pub(crate) fn drain(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(u64::from_ne_bytes(buf)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Installs `SIG_IGN` for `SIGPIPE` so writes to a peer that reset the
/// connection return `EPIPE` instead of killing the process.
pub(crate) fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
