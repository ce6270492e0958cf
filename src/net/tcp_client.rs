//! Drives a `Connector` to establish one outbound connection, optionally
//! reconnecting on disconnect.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::net::connector::Connector;
use crate::net::inet_address::InetAddress;
use crate::net::sockets;
use crate::net::tcp_connection::TcpConnection;

pub struct TcpClient {
    loop_: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: Mutex<i64>,
    connection: Mutex<Option<TcpConnectionPtr>>,
}

impl TcpClient {
    pub fn new(loop_: Arc<EventLoop>, server_addr: InetAddress, name: impl Into<String>) -> Arc<TcpClient> {
        let connector = Connector::new(&loop_, server_addr);
        let client = Arc::new(TcpClient {
            loop_,
            connector,
            name: name.into(),
            connection_callback: Mutex::new(Arc::new(default_connection_callback)),
            message_callback: Mutex::new(Arc::new(default_message_callback)),
            write_complete_callback: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: Mutex::new(1),
            connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        client.connector.set_new_connection_callback(Box::new(move |fd| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(fd);
            }
        }));

        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    pub fn retry(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.lock().unwrap().clone()
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

    pub fn connect(&self) {
        log::trace!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.connector.server_address()
        );
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection.lock().unwrap().clone() {
            conn.shutdown();
        }
    }

    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(self: &Arc<Self>, sockfd: OwnedFd) {
        self.loop_.assert_in_loop_thread();
        let fd = sockfd.as_raw_fd();
        let peer_addr = sockets::peer_addr(fd).unwrap_or(self.connector.server_address());
        let local_addr = sockets::local_addr(fd).unwrap_or(peer_addr);

        let conn_id = {
            let mut next = self.next_conn_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = TcpConnection::new(&self.loop_, conn_name, sockfd, local_addr, peer_addr);

        conn.set_connection_callback(Arc::clone(&self.connection_callback.lock().unwrap()));
        conn.set_message_callback(Arc::clone(&self.message_callback.lock().unwrap()));
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(Arc::clone(&conn));
        conn.connect_established();
    }

    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();

        {
            let mut slot = self.connection.lock().unwrap();
            debug_assert!(slot.as_ref().map(|c| Arc::ptr_eq(c, conn)).unwrap_or(false));
            *slot = None;
        }

        let conn = Arc::clone(conn);
        self.loop_.queue_in_loop(move || conn.connect_destroyed());

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            log::trace!(
                "TcpClient::connect [{}] - reconnecting to {}",
                self.name,
                self.connector.server_address()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        log::trace!("TcpClient::drop [{}]", self.name);

        let (conn, unique) = {
            let slot = self.connection.lock().unwrap();
            let unique = slot.as_ref().map(|c| Arc::strong_count(c) == 1).unwrap_or(false);
            (slot.clone(), unique)
        };

        if let Some(conn) = conn {
            let detach_cb: CloseCallback = Arc::new(|conn: &TcpConnectionPtr| {
                if let Some(io_loop) = conn.get_loop() {
                    let conn = Arc::clone(conn);
                    io_loop.queue_in_loop(move || conn.connect_destroyed());
                }
            });
            let conn_for_cb = Arc::clone(&conn);
            self.loop_.run_in_loop(move || conn_for_cb.set_close_callback(detach_cb));

            if unique {
                conn.force_close();
            }
        } else {
            self.connector.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
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

    #[test]
    fn connects_and_exchanges_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 5];
                if stream.read_exact(&mut buf).is_ok() {
                    let _ = stream.write_all(&buf);
                }
            }
        });

        let (loop_, handle) = spawn_loop();
        let addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();
        let client = TcpClient::new(Arc::clone(&loop_), addr, "test-client");

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&received);
        client.set_message_callback(Arc::new(move |_conn: &TcpConnectionPtr, buf: &mut Buffer, _t| {
            r.lock().unwrap().extend_from_slice(&buf.retrieve_all_as_string());
        }));

        client.connect();
        std::thread::sleep(Duration::from_millis(100));

        let conn = client.connection().expect("connection should be established");
        conn.send(b"hello");
        std::thread::sleep(Duration::from_millis(150));

        assert_eq!(*received.lock().unwrap(), b"hello");

        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn enable_retry_reconnects_after_peer_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept_count = Arc::new(AtomicUsize::new(0));
        let ac = Arc::clone(&accept_count);
        std::thread::spawn(move || {
            for stream in listener.incoming().take(2) {
                if let Ok(stream) = stream {
                    ac.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }
            }
        });

        let (loop_, handle) = spawn_loop();
        let addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();
        let client = TcpClient::new(Arc::clone(&loop_), addr, "test-client-retry");
        client.enable_retry();
        client.connect();

        std::thread::sleep(Duration::from_millis(300));
        assert!(accept_count.load(Ordering::SeqCst) >= 2);

        client.stop();
        loop_.quit();
        handle.join().unwrap();
    }

    #[test]
    fn drop_closes_the_connection_when_uniquely_held() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (server_tx, server_rx) = mpsc::channel();
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let _ = server_tx.send(stream);
            }
        });

        let (loop_, handle) = spawn_loop();
        let addr = InetAddress::from_ip_port("127.0.0.1", port).unwrap();
        let client = TcpClient::new(Arc::clone(&loop_), addr, "test-client-drop");
        client.connect();

        let mut server_stream = server_rx.recv_timeout(Duration::from_millis(500)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        drop(client);

        server_stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut buf = [0u8; 1];
        let n = server_stream.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);

        loop_.quit();
        handle.join().unwrap();
    }
}
