use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{error, info};

use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::sys::Socket;

/// Receives each freshly accepted connection and its peer address.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddrV4) + Send>;

/// The listening socket and its read-armed channel on the base loop.
///
/// An accepted descriptor is handed to the new-connection callback, or
/// closed on the spot when none is installed. Running out of descriptors
/// is reported and otherwise left to the operator; the listening channel
/// stays armed.
pub struct Acceptor {
    // kept so the channel can still reach its poller when the acceptor
    // is torn down
    event_loop: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: SocketAddrV4,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let accept_socket = Socket::new_nonblocking_stream()?;
        accept_socket.set_reuse_addr(true)?;
        accept_socket.set_reuse_port(reuse_port)?;
        accept_socket.bind(listen_addr)?;

        let accept_channel = Channel::new(Arc::downgrade(&event_loop), accept_socket.fd());

        let acceptor = Arc::new(Acceptor {
            event_loop,
            accept_socket,
            accept_channel,
            listening: AtomicBool::new(false),
            new_connection_callback: Mutex::new(None),
        });

        let handler: Arc<dyn EventHandler> = acceptor.clone();
        acceptor.accept_channel.tie(Arc::downgrade(&handler));

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(callback);
    }

    /// Starts listening and arms the accept channel. Runs on the base
    /// loop's thread.
    pub fn listen(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        self.listening.store(true, Ordering::Release);

        if let Err(e) = self.accept_socket.listen() {
            error!("acceptor failed to listen: {}", e);
            panic!("listen failed: {}", e);
        }

        self.accept_channel.enable_reading();
        info!(
            "acceptor listening on fd = {}",
            self.accept_socket.fd()
        );
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }
}

impl EventHandler for Acceptor {
    fn handle_read(self: Arc<Self>, _receive_time: Instant) {
        match self.accept_socket.accept() {
            Ok((socket, peer_addr)) => {
                let mut callback = self.new_connection_callback.lock().unwrap();
                match callback.as_mut() {
                    Some(callback) => callback(socket, peer_addr),
                    // nobody wants it: closing keeps the backlog moving
                    None => drop(socket),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("acceptor failed to accept: {}", e);
                if e.raw_os_error() == Some(libc::EMFILE) {
                    error!("accept hit the open file limit, raise it or shed load");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.accept_channel.disable_all();
        self.accept_channel.remove();
    }
}
