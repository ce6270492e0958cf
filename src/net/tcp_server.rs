//! Accepts connections on a listening socket and hands each one to an
//! `EventLoop` from a round-robin thread pool.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnectionPtr, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::event_loop_thread::ThreadInitCallback;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::net::acceptor::Acceptor;
use crate::net::inet_address::InetAddress;
use crate::net::sockets;
use crate::net::tcp_connection::TcpConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortReuse {
    Disabled,
    Enabled,
}

pub struct TcpServer {
    loop_: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Mutex<EventLoopThreadPool>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    started: AtomicBool,
    next_conn_id: Mutex<i64>,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    pub fn new(
        loop_: Arc<EventLoop>,
        listen_addr: InetAddress,
        name: impl Into<String>,
        port_reuse: PortReuse,
    ) -> Arc<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(&loop_, &listen_addr, port_reuse == PortReuse::Enabled)
            .unwrap_or_else(|e| panic!("TcpServer::new: failed to create acceptor: {e}"));

        let server = Arc::new(TcpServer {
            ip_port: listen_addr.ip_port(),
            thread_pool: Mutex::new(EventLoopThreadPool::new(Arc::clone(&loop_), name.clone())),
            loop_,
            name,
            acceptor,
            connection_callback: Mutex::new(Arc::new(default_connection_callback)),
            message_callback: Mutex::new(Arc::new(default_message_callback)),
            write_complete_callback: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: Mutex::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(Box::new(move |fd, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(fd, peer_addr);
            }
        }));

        server
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    /// `num_threads` == 0 keeps all I/O on the acceptor's loop; N spreads
    /// accepted connections round-robin across N worker loops.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.thread_pool.lock().unwrap().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.lock().unwrap() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(cb);
    }

    pub fn start(&self, thread_init_callback: Option<ThreadInitCallback>) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.thread_pool.lock().unwrap().start(thread_init_callback);
            debug_assert!(!self.acceptor.listening());
            let acceptor = Arc::clone(&self.acceptor);
            self.loop_.run_in_loop(move || acceptor.listen());
        }
    }

    fn new_connection(self: &Arc<Self>, sockfd: OwnedFd, peer_addr: InetAddress) {
        self.loop_.assert_in_loop_thread();
        let io_loop = self.thread_pool.lock().unwrap().get_next_loop();

        let conn_id = {
            let mut next = self.next_conn_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        log::trace!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name,
            conn_name,
            peer_addr
        );

        let local_addr = sockets::local_addr(sockfd.as_raw_fd()).unwrap_or(peer_addr);
        let conn = TcpConnection::new(&io_loop, conn_name.clone(), sockfd, local_addr, peer_addr);

        conn.set_connection_callback(Arc::clone(&self.connection_callback.lock().unwrap()));
        conn.set_message_callback(Arc::clone(&self.message_callback.lock().unwrap()));
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections.lock().unwrap().insert(conn_name, Arc::clone(&conn));

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Thread safe: always hops back onto the acceptor's loop.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.loop_.run_in_loop(move || this.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        log::trace!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        let removed = self.connections.lock().unwrap().remove(conn.name());
        debug_assert!(removed.is_some());

        let conn = Arc::clone(conn);
        if let Some(io_loop) = conn.get_loop() {
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.loop_.assert_in_loop_thread();
        log::trace!("TcpServer::drop [{}] destructing", self.name);
        for (_, conn) in self.connections.lock().unwrap().drain() {
            if let Some(io_loop) = conn.get_loop() {
                io_loop.run_in_loop(move || conn.connect_destroyed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
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

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn accepts_and_echoes() {
        let (loop_, handle) = spawn_loop();
        let port = free_port();
        let listen_addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();
        let server = TcpServer::new(Arc::clone(&loop_), listen_addr, "test-server", PortReuse::Enabled);

        server.set_message_callback(Arc::new(|conn: &TcpConnectionPtr, buf: &mut Buffer, _t| {
            let data = buf.retrieve_all_as_string();
            conn.send(&data);
        }));
        server.start(None);
        std::thread::sleep(Duration::from_millis(50));

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"ping").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn connection_map_shrinks_after_peer_disconnects() {
        let (loop_, handle) = spawn_loop();
        let port = free_port();
        let listen_addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();
        let server = TcpServer::new(Arc::clone(&loop_), listen_addr, "test-server2", PortReuse::Enabled);
        server.start(None);
        std::thread::sleep(Duration::from_millis(50));

        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(server.connections.lock().unwrap().len(), 1);

        drop(client);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(server.connections.lock().unwrap().len(), 0);

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn set_thread_num_spreads_connections_across_workers() {
        let (loop_, handle) = spawn_loop();
        let port = free_port();
        let listen_addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();
        let server = TcpServer::new(Arc::clone(&loop_), listen_addr, "test-server3", PortReuse::Enabled);
        server.set_thread_num(2);
        server.start(None);
        std::thread::sleep(Duration::from_millis(50));

        let _clients: Vec<_> = (0..4)
            .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
            .collect();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(server.connections.lock().unwrap().len(), 4);

        let io_loops: std::collections::HashSet<_> = server
            .connections
            .lock()
            .unwrap()
            .values()
            .filter_map(|c| c.get_loop().map(|l| Arc::as_ptr(&l) as usize))
            .collect();
        assert!(io_loops.len() > 1);

        loop_.quit();
        handle.join().unwrap();
    }
}
