//! Callback type aliases shared across the connection/server/client layers.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::net::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type TimerCallback = Box<dyn FnMut() + Send>;
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback =
    Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    log::trace!(
        "{} -> {} is {}",
        conn.local_addr().ip_port(),
        conn.peer_addr().ip_port(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _time: Timestamp) {
    buf.retrieve_all();
}
