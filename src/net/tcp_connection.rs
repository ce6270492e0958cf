//! One established (or half-established) TCP connection: owns the input
//! and output application buffers, the read/write/close/error dispatch, and
//! the backpressure bookkeeping around the output buffer's high water mark.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use crate::buffer::Buffer;
use crate::callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::inet_address::InetAddress;
use crate::net::sockets;
use crate::timestamp::Timestamp;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl State {
    fn as_str(&self) -> &'static str {
        match self {
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Disconnecting => "disconnecting",
            State::Disconnected => "disconnected",
        }
    }
}

pub struct TcpConnection {
    loop_: Weak<EventLoop>,
    name: String,
    state: Cell<State>,
    reading: Cell<bool>,
    fd: RawFd,
    _socket: OwnedFd,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_callback: RefCell<Option<HighWaterMarkCallback>>,
    high_water_mark: Cell<usize>,
    close_callback: RefCell<Option<CloseCallback>>,
    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    weak_self: RefCell<Weak<TcpConnection>>,
}

// SAFETY: every field is mutated exclusively from the owning EventLoop's
// thread; `send`/`shutdown`/`force_close` are the cross-thread entry points
// and they hop onto the loop before touching any of this state.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    pub(crate) fn new(
        loop_: &Arc<EventLoop>,
        name: String,
        sockfd: OwnedFd,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<TcpConnection> {
        let fd = sockfd.as_raw_fd();
        let channel = Channel::new(Arc::downgrade(loop_), fd);

        let conn = Arc::new(TcpConnection {
            loop_: Arc::downgrade(loop_),
            name,
            state: Cell::new(State::Connecting),
            reading: Cell::new(true),
            fd,
            _socket: sockfd,
            channel,
            local_addr,
            peer_addr,
            connection_callback: RefCell::new(Arc::new(default_connection_callback)),
            message_callback: RefCell::new(Arc::new(default_message_callback)),
            write_complete_callback: RefCell::new(None),
            high_water_mark_callback: RefCell::new(None),
            high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
            close_callback: RefCell::new(None),
            input_buffer: RefCell::new(Buffer::new()),
            output_buffer: RefCell::new(Buffer::new()),
            weak_self: RefCell::new(Weak::new()),
        });

        *conn.weak_self.borrow_mut() = Arc::downgrade(&conn);

        let weak_read = Arc::downgrade(&conn);
        conn.channel.set_read_callback(move |time| {
            if let Some(conn) = weak_read.upgrade() {
                conn.handle_read(time);
            }
        });
        let weak_write = Arc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak_write.upgrade() {
                conn.handle_write();
            }
        });
        let weak_close = Arc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak_close.upgrade() {
                conn.handle_close();
            }
        });
        let weak_error = Arc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak_error.upgrade() {
                conn.handle_error();
            }
        });

        log::trace!("TcpConnection::new [{}] fd={}", conn.name, fd);
        if let Err(e) = sockets::set_keep_alive(fd, true) {
            log::warn!("TcpConnection::new: set_keep_alive failed: {e}");
        }

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state.get() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state.get() == State::Disconnected
    }

    pub fn is_reading(&self) -> bool {
        self.reading.get()
    }

    pub fn get_loop(&self) -> Option<Arc<EventLoop>> {
        self.loop_.upgrade()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.borrow_mut() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.borrow_mut() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.borrow_mut() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, high_water_mark: usize) {
        *self.high_water_mark_callback.borrow_mut() = Some(cb);
        self.high_water_mark.set(high_water_mark);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.borrow_mut() = Some(cb);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = sockets::set_tcp_nodelay(self.fd, on) {
            log::warn!("set_tcp_no_delay: {e}");
        }
    }

    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state.get() != State::Connected {
            return;
        }
        if self.in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = Arc::clone(self);
            let owned = data.to_vec();
            if let Some(loop_) = self.loop_.upgrade() {
                loop_.run_in_loop(move || this.send_in_loop(&owned));
            }
        }
    }

    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state.get() != State::Connected {
            return;
        }
        if self.in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let this = Arc::clone(self);
            let owned = buf.retrieve_all_as_string();
            if let Some(loop_) = self.loop_.upgrade() {
                loop_.run_in_loop(move || this.send_in_loop(&owned));
            }
        }
    }

    /// Not thread safe: the caller must not call `shutdown` concurrently
    /// with itself.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state.get() == State::Connected {
            self.state.set(State::Disconnecting);
            let this = Arc::clone(self);
            if let Some(loop_) = self.loop_.upgrade() {
                loop_.run_in_loop(move || this.shutdown_in_loop());
            }
        }
    }

    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.state.set(State::Disconnecting);
            let this = Arc::clone(self);
            if let Some(loop_) = self.loop_.upgrade() {
                loop_.queue_in_loop(move || this.force_close_in_loop());
            }
        }
    }

    pub fn force_close_with_delay(self: &Arc<Self>, seconds: f64) {
        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.state.set(State::Disconnecting);
            let weak = Arc::downgrade(self);
            if let Some(loop_) = self.loop_.upgrade() {
                loop_.run_after(
                    seconds,
                    Box::new(move || {
                        if let Some(conn) = weak.upgrade() {
                            conn.force_close();
                        }
                    }),
                );
            }
        }
    }

    pub fn start_read(self: &Arc<Self>) {
        let this = Arc::clone(self);
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.run_in_loop(move || this.start_read_in_loop());
        }
    }

    pub fn stop_read(self: &Arc<Self>) {
        let this = Arc::clone(self);
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.run_in_loop(move || this.stop_read_in_loop());
        }
    }

    fn in_loop_thread(&self) -> bool {
        self.loop_.upgrade().map(|l| l.is_in_loop_thread()).unwrap_or(true)
    }

    fn send_in_loop(&self, data: &[u8]) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }

        if self.state.get() == State::Disconnected {
            log::warn!("disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut fault_error = false;
        let mut output = self.output_buffer.borrow_mut();

        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match sockets::write(self.fd, data) {
                Ok(n) => {
                    nwrote = n;
                    if nwrote == data.len() {
                        if let Some(cb) = self.write_complete_callback.borrow().clone() {
                            self.queue_write_complete(cb);
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        log::error!("TcpConnection::send_in_loop: {e}");
                        if e.raw_os_error() == Some(libc::EPIPE)
                            || e.raw_os_error() == Some(libc::ECONNRESET)
                        {
                            fault_error = true;
                        }
                    }
                }
            }
        }

        if !fault_error && nwrote < data.len() {
            let remaining = &data[nwrote..];
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.get();
            if old_len + remaining.len() >= high_water_mark
                && old_len < high_water_mark
            {
                if let Some(cb) = self.high_water_mark_callback.borrow().clone() {
                    let total = old_len + remaining.len();
                    self.queue_high_water_mark(cb, total);
                }
            }
            output.append(remaining);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn queue_write_complete(&self, cb: WriteCompleteCallback) {
        if let Some(loop_) = self.loop_.upgrade() {
            if let Some(this) = self.self_ptr() {
                loop_.queue_in_loop(move || cb(&this));
            }
        }
    }

    fn queue_high_water_mark(&self, cb: HighWaterMarkCallback, total: usize) {
        if let Some(loop_) = self.loop_.upgrade() {
            if let Some(this) = self.self_ptr() {
                loop_.queue_in_loop(move || cb(&this, total));
            }
        }
    }

    /// Recovers a strong `Arc<TcpConnection>` from `self` for posting into
    /// closures.
    fn self_ptr(&self) -> Option<TcpConnectionPtr> {
        self.weak_self.borrow().upgrade()
    }

    fn shutdown_in_loop(&self) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        if !self.channel.is_writing() {
            if let Err(e) = sockets::shutdown_write(self.fd) {
                log::warn!("shutdown_in_loop: {e}");
            }
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }

    fn start_read_in_loop(&self) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        if !self.reading.get() || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.set(true);
        }
    }

    fn stop_read_in_loop(&self) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        if self.reading.get() || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.set(false);
        }
    }

    /// Called once by whoever accepted/adopted this connection, right
    /// after construction.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        debug_assert_eq!(self.state.get(), State::Connecting);
        self.state.set(State::Connected);
        self.channel.tie(Arc::downgrade(self) as Weak<dyn Any + Send + Sync>);
        self.channel.enable_reading();
        (self.connection_callback.borrow())(self);
    }

    /// Called once by the owning server/client after it has removed this
    /// connection from its map.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        if self.state.get() == State::Connected {
            self.state.set(State::Disconnected);
            self.channel.disable_all();
            (self.connection_callback.borrow())(self);
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        let mut input = self.input_buffer.borrow_mut();
        match input.read_fd(self.fd) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let cb = self.message_callback.borrow().clone();
                cb(self, &mut input, receive_time);
            }
            Err(e) => {
                drop(input);
                log::error!("TcpConnection::handle_read: {e}");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        if !self.channel.is_writing() {
            log::trace!("connection fd={} is down, no more writing", self.fd);
            return;
        }

        let mut output = self.output_buffer.borrow_mut();
        match sockets::write(self.fd, output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = self.write_complete_callback.borrow().clone() {
                        drop(output);
                        self.queue_write_complete(cb);
                    } else {
                        drop(output);
                    }
                    if self.state.get() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => {
                log::error!("TcpConnection::handle_write: {e}");
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        if let Some(loop_) = self.loop_.upgrade() {
            loop_.assert_in_loop_thread();
        }
        log::trace!(
            "fd={} state={}",
            self.fd,
            self.state.get().as_str()
        );
        debug_assert!(matches!(self.state.get(), State::Connected | State::Disconnecting));
        self.state.set(State::Disconnected);
        self.channel.disable_all();

        (self.connection_callback.borrow())(self);
        if let Some(cb) = self.close_callback.borrow().clone() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = sockets::get_socket_error(self.fd).unwrap_or(-1);
        log::error!("TcpConnection::handle_error [{}] SO_ERROR = {err}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn spawn_loop() -> (Arc<EventLoop>, std::thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let loop_ = EventLoop::new().unwrap();
            tx.send(Arc::clone(&loop_)).unwrap();
            loop_.run();
        });
        (rx.recv().unwrap(), handle)
    }

    fn accepted_pair() -> (TcpStream, OwnedFd, InetAddress, InetAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let local = server.local_addr().unwrap();
        let peer_addr = InetAddress::from_socket_addr(peer);
        let local_addr = InetAddress::from_socket_addr(local);
        (client, OwnedFd::from(server), local_addr, peer_addr)
    }

    #[test]
    fn echoes_received_data_back_to_the_peer() {
        let (mut client, server_fd, local, peer) = accepted_pair();
        let (loop_, handle) = spawn_loop();
        let conn = TcpConnection::new(&loop_, "echo-test".into(), server_fd, local, peer);

        conn.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buf: &mut Buffer, _time| {
            let data = buf.retrieve_all_as_string();
            conn.send(&data);
        }));

        let c = Arc::clone(&conn);
        loop_.run_in_loop(move || c.connect_established());
        std::thread::sleep(Duration::from_millis(50));

        client.write_all(b"hello").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_half_closes_after_pending_output_drains() {
        let (mut client, server_fd, local, peer) = accepted_pair();
        let (loop_, handle) = spawn_loop();
        let conn = TcpConnection::new(&loop_, "shutdown-test".into(), server_fd, local, peer);

        let c = Arc::clone(&conn);
        loop_.run_in_loop(move || c.connect_established());
        std::thread::sleep(Duration::from_millis(50));

        conn.send(b"bye");
        conn.shutdown();

        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn high_water_mark_callback_fires_past_threshold() {
        let (client, server_fd, local, peer) = accepted_pair();
        let (loop_, handle) = spawn_loop();
        let conn = TcpConnection::new(&loop_, "hwm-test".into(), server_fd, local, peer);

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        conn.set_high_water_mark_callback(
            Arc::new(move |_conn, _len| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            1024,
        );

        let c = Arc::clone(&conn);
        loop_.run_in_loop(move || c.connect_established());
        std::thread::sleep(Duration::from_millis(50));

        // The peer never reads, so most of this backs up in the connection's
        // own output buffer well past the 1 KiB high water mark.
        conn.send(&vec![1u8; 4 * 1024 * 1024]);
        std::thread::sleep(Duration::from_millis(200));

        assert!(fired.load(Ordering::SeqCst) >= 1);

        drop(client);
        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn force_close_tears_down_without_waiting_for_output() {
        let (client, server_fd, local, peer) = accepted_pair();
        let (loop_, handle) = spawn_loop();
        let conn = TcpConnection::new(&loop_, "force-close-test".into(), server_fd, local, peer);

        let c = Arc::clone(&conn);
        loop_.run_in_loop(move || c.connect_established());
        std::thread::sleep(Duration::from_millis(50));
        assert!(conn.connected());

        conn.force_close();
        std::thread::sleep(Duration::from_millis(100));
        assert!(conn.disconnected());

        drop(client);
        loop_.quit();
        handle.join().unwrap();
    }
}
