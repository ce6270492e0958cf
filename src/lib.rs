//! A single-threaded-reactor TCP networking framework: one `EventLoop` per
//! thread, with an optional pool of such threads for spreading accepted
//! connections across cores.
//!
//! The object graph mirrors the classic "one loop per thread" design: an
//! [`EventLoop`] owns a [`Poller`](poller) and a set of [`Channel`]s, a
//! [`TcpServer`] owns an `Acceptor` and hands each accepted socket to a
//! [`TcpConnection`] running on a loop drawn from an
//! [`EventLoopThreadPool`], and a [`TcpClient`] drives a `Connector` to
//! the same end for outbound connections.
//!
//! Only Linux is supported: the poller backends are built on `poll(2)` and
//! `epoll(2)`, and the timer queue is built on `timerfd_create(2)`.

#![cfg(unix)]

mod buffer;
mod callbacks;
mod channel;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
pub mod net;
mod poller;
mod sys;
mod timer;
mod timer_queue;
mod timestamp;

pub use buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    TimerCallback, WriteCompleteCallback,
};
pub use channel::Channel;
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, ThreadInitCallback};
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use net::{InetAddress, PortReuse, TcpClient, TcpConnection, TcpServer};
pub use poller::POLLER_ENV_VAR;
pub use timer::TimerId;
pub use timestamp::{Timestamp, MICROSECONDS_PER_SECOND};
