//! Drives a non-blocking `connect(2)` to completion, retrying with
//! exponential backoff on transient failures.

use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::inet_address::InetAddress;
use crate::net::sockets;

const MAX_RETRY_DELAY_MS: i64 = 30_000;
const INIT_RETRY_DELAY_MS: i64 = 500;

pub(crate) type NewConnectionCallback = Box<dyn Fn(OwnedFd) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) struct Connector {
    loop_: Weak<EventLoop>,
    server_addr: InetAddress,
    connect: Cell<bool>,
    state: Cell<State>,
    channel: RefCell<Option<Arc<Channel>>>,
    new_connection_callback: RefCell<Option<NewConnectionCallback>>,
    retry_delay_ms: Cell<i64>,
}

// SAFETY: every field is mutated exclusively on the owning EventLoop's
// thread; `start`/`stop` are the only entry points called from elsewhere and
// they immediately hop onto the loop.
unsafe impl Send for Connector {}
unsafe impl Sync for Connector {}

impl Connector {
    pub(crate) fn new(loop_: &Arc<EventLoop>, server_addr: InetAddress) -> Arc<Connector> {
        Arc::new(Connector {
            loop_: Arc::downgrade(loop_),
            server_addr,
            connect: Cell::new(false),
            state: Cell::new(State::Disconnected),
            channel: RefCell::new(None),
            new_connection_callback: RefCell::new(None),
            retry_delay_ms: Cell::new(INIT_RETRY_DELAY_MS),
        })
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_callback.borrow_mut() = Some(cb);
    }

    pub(crate) fn server_address(&self) -> InetAddress {
        self.server_addr
    }

    /// Can be called from any thread.
    pub(crate) fn start(self: &Arc<Self>) {
        self.connect.set(true);
        let this = Arc::clone(self);
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.run_in_loop(move || this.start_in_loop());
        }
    }

    /// Must be called on the loop thread.
    pub(crate) fn restart(self: &Arc<Self>) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        self.state.set(State::Disconnected);
        self.retry_delay_ms.set(INIT_RETRY_DELAY_MS);
        self.connect.set(true);
        self.start_in_loop();
    }

    /// Can be called from any thread.
    pub(crate) fn stop(self: &Arc<Self>) {
        self.connect.set(false);
        let this = Arc::clone(self);
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.queue_in_loop(move || this.stop_in_loop());
        }
    }

    fn start_in_loop(self: &Arc<Self>) {
        debug_assert_eq!(self.state.get(), State::Disconnected);
        if self.connect.get() {
            self.do_connect();
        } else {
            log::trace!("connector: do not connect");
        }
    }

    fn stop_in_loop(self: &Arc<Self>) {
        if self.state.get() == State::Connecting {
            self.state.set(State::Disconnected);
            let fd = self.remove_and_reset_channel();
            self.retry(fd);
        }
    }

    fn do_connect(self: &Arc<Self>) {
        let family = if self.server_addr.is_ipv6() {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let fd = match sockets::create_nonblocking(family) {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("connector: failed to create socket: {e}");
                return;
            }
        };
        let raw_fd = fd.as_raw_fd();
        let result = sockets::connect(raw_fd, &self.server_addr);

        match result {
            Ok(()) => self.connecting(fd),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(fd)
                }
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => {
                    log::trace!("connector: retrying after connect error {e}");
                    std::mem::forget(fd);
                    self.retry(raw_fd);
                }
                Some(libc::EACCES)
                | Some(libc::EPERM)
                | Some(libc::EAFNOSUPPORT)
                | Some(libc::EALREADY)
                | Some(libc::EBADF)
                | Some(libc::EFAULT)
                | Some(libc::ENOTSOCK) => {
                    log::error!("connector: fatal connect error: {e}");
                }
                _ => {
                    log::error!("connector: unexpected connect error: {e}");
                }
            },
        }
    }

    fn connecting(self: &Arc<Self>, fd: OwnedFd) {
        self.state.set(State::Connecting);
        debug_assert!(self.channel.borrow().is_none());

        let raw_fd = fd.as_raw_fd();
        // `fd` is intentionally leaked into the raw descriptor the Channel
        // tracks; ownership passes to the eventual TcpConnection (on
        // success) or is reclaimed by `retry`/`stop_in_loop` (on failure).
        std::mem::forget(fd);

        let loop_ = match self.loop_.upgrade() {
            Some(l) => l,
            None => return,
        };
        let channel = Channel::new(Arc::downgrade(&loop_), raw_fd);

        let this_write = Arc::clone(self);
        channel.set_write_callback(move || this_write.handle_write());
        let this_err = Arc::clone(self);
        channel.set_error_callback(move || this_err.handle_error());
        // Not tied to a TcpConnection: none exists until the connect
        // completes, so Connector keeps itself alive via its own Arc
        // instead.
        channel.enable_writing();

        *self.channel.borrow_mut() = Some(channel);
    }

    fn remove_and_reset_channel(&self) -> RawFd {
        let channel = self.channel.borrow_mut().take().expect("channel missing");
        channel.disable_all();
        channel.remove();
        channel.fd()
    }

    fn handle_write(self: &Arc<Self>) {
        if self.state.get() != State::Connecting {
            return;
        }

        let fd = self.remove_and_reset_channel();
        match sockets::get_socket_error(fd) {
            Ok(0) if !sockets::is_self_connect(fd) => {
                self.state.set(State::Connected);
                if self.connect.get() {
                    if let Some(cb) = self.new_connection_callback.borrow().as_ref() {
                        cb(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                } else {
                    sockets::close(fd);
                }
            }
            Ok(0) => {
                log::trace!("connector: self connect, retrying");
                self.retry(fd);
            }
            Ok(err) => {
                log::trace!("connector: SO_ERROR = {err}");
                self.retry(fd);
            }
            Err(e) => {
                log::error!("connector: getsockopt failed: {e}");
                self.retry(fd);
            }
        }
    }

    fn handle_error(self: &Arc<Self>) {
        if self.state.get() == State::Connecting {
            let fd = self.remove_and_reset_channel();
            let err = sockets::get_socket_error(fd).unwrap_or(-1);
            log::trace!("connector: handle_error SO_ERROR = {err}");
            self.retry(fd);
        }
    }

    fn retry(self: &Arc<Self>, fd: RawFd) {
        sockets::close(fd);
        self.state.set(State::Disconnected);

        if self.connect.get() {
            let delay_ms = self.retry_delay_ms.get();
            log::trace!(
                "connector: retrying to {} in {} ms",
                self.server_addr,
                delay_ms
            );
            let this = Arc::clone(self);
            if let Some(loop_) = self.loop_.upgrade() {
                loop_.run_after(delay_ms as f64 / 1000.0, Box::new(move || this.start_in_loop()));
            }
            self.retry_delay_ms.set((delay_ms * 2).min(MAX_RETRY_DELAY_MS));
        } else {
            log::trace!("connector: do not connect");
        }
    }
}
