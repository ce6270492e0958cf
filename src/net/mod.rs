//! Connection-level building blocks: addresses, raw socket syscalls, and
//! the three user-facing connection-lifecycle types.

mod acceptor;
mod connector;

pub mod inet_address;
pub(crate) mod sockets;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_server;

pub use inet_address::InetAddress;
pub use tcp_client::TcpClient;
pub use tcp_connection::TcpConnection;
pub use tcp_server::{PortReuse, TcpServer};
