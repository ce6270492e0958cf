//! Owns the listening socket: binds, listens, and turns incoming
//! connections into callbacks. Recovers from descriptor exhaustion by
//! sacrificing one spare fd instead of spinning on `EMFILE`.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::inet_address::InetAddress;
use crate::net::sockets;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(OwnedFd, InetAddress) + Send>;

pub(crate) struct Acceptor {
    loop_: Weak<EventLoop>,
    accept_fd: RawFd,
    // Keeps the listening socket's fd alive for the Acceptor's lifetime;
    // the Channel only borrows the raw fd.
    _accept_socket: OwnedFd,
    channel: Arc<Channel>,
    new_connection_callback: RefCell<Option<NewConnectionCallback>>,
    listening: Cell<bool>,
    idle_fd: RefCell<Option<OwnedFd>>,
}

// SAFETY: every field is mutated exclusively from the owning EventLoop's
// thread, same argument as Channel/EventLoop.
unsafe impl Send for Acceptor {}
unsafe impl Sync for Acceptor {}

impl Acceptor {
    pub(crate) fn new(
        loop_: &Arc<EventLoop>,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let family = if listen_addr.is_ipv6() {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let accept_socket = sockets::create_nonblocking(family)?;
        let accept_fd = accept_socket.as_raw_fd();

        sockets::set_reuse_addr(accept_fd, true)?;
        sockets::set_reuse_port(accept_fd, reuse_port)?;
        sockets::bind(accept_fd, listen_addr)?;

        let idle_fd = open_dev_null()?;
        let channel = Channel::new(Arc::downgrade(loop_), accept_fd);

        let acceptor = Arc::new(Acceptor {
            loop_: Arc::downgrade(loop_),
            accept_fd,
            _accept_socket: accept_socket,
            channel,
            new_connection_callback: RefCell::new(None),
            listening: Cell::new(false),
            idle_fd: RefCell::new(Some(idle_fd)),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_time| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_callback.borrow_mut() = Some(cb);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.get()
    }

    pub(crate) fn listen(&self) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        self.listening.set(true);
        if let Err(e) = sockets::listen(self.accept_fd) {
            log::error!("Acceptor::listen: {e}");
        }
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }

        match sockets::accept(self.accept_fd) {
            Ok((conn_fd, peer_addr)) => {
                if let Some(cb) = self.new_connection_callback.borrow_mut().as_mut() {
                    cb(conn_fd, peer_addr);
                } else {
                    sockets::close(conn_fd.as_raw_fd());
                }
            }
            Err(e) => {
                log::warn!("in Acceptor::handle_read: {e}");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    // Sacrifice the spare fd to regain enough headroom for
                    // one accept(2), just to close it again immediately.
                    self.idle_fd.borrow_mut().take();
                    if let Ok((connfd, _)) = sockets::accept(self.accept_fd) {
                        drop(connfd);
                    }
                    match open_dev_null() {
                        Ok(fd) => *self.idle_fd.borrow_mut() = Some(fd),
                        Err(e) => log::error!("Acceptor: failed to reopen /dev/null: {e}"),
                    }
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn open_dev_null() -> io::Result<OwnedFd> {
    let fd = crate::sys::syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
