//! A multi-reactor TCP server framework.
//!
//! Applications write a concurrent, non-blocking TCP service by supplying
//! callbacks for connection, message, write-complete and close events. One
//! [`EventLoop`] runs per thread: the base loop accepts, a pool of worker
//! loops carries the connections, and each descriptor stays pinned to its
//! loop for life. Cross-thread work goes through each loop's task queue,
//! woken by an eventfd.
//!
//! # Example
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! use hive_io::{EventLoop, TcpServer};
//!
//! let base_loop = EventLoop::new().unwrap();
//! let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8000);
//!
//! let server = TcpServer::new(base_loop.clone(), addr, "echo", true).unwrap();
//! server.set_thread_num(4);
//! server.set_message_callback(|conn, buffer, _receive_time| {
//!     let message = buffer.retrieve_all_as_string();
//!     conn.send(message.as_bytes());
//! });
//!
//! server.start().unwrap();
//! base_loop.run();
//! ```
//!
//! Callbacks run on the loop that owns the connection and must not block
//! or panic; [`TcpConnection::send`] alone is safe to call from any
//! thread.

#[macro_use]
mod sys;

mod buffer;
mod channel;
mod event_loop;
mod event_loop_thread;
mod net;
mod poller;
mod thread;
mod thread_pool;

pub use buffer::Buffer;
pub use channel::{Channel, EventHandler, Ready};
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, ThreadInitCallback};
pub use net::{
    Acceptor, ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    NewConnectionCallback, TcpConnection, TcpServer, WriteCompleteCallback,
};
pub use poller::Poller;
pub use sys::Socket;
pub use thread::Thread;
pub use thread_pool::EventLoopThreadPool;
