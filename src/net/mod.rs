//! The TCP side of the framework: the acceptor on the base loop, the
//! buffered connection on its worker loop, and the server tying the two
//! together through the connection registry.

mod acceptor;
mod conn;
mod server;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use conn::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use server::TcpServer;
