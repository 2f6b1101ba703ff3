use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use indexmap::IndexMap;
use log::{error, info};

use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::ThreadInitCallback;
use crate::net::acceptor::Acceptor;
use crate::net::conn::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::sys::Socket;
use crate::thread_pool::EventLoopThreadPool;

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

/// The server: acceptor on the base loop, a pool of worker loops, and the
/// registry of live connections.
///
/// Each accepted connection lands on the next worker loop, gets the
/// server-level callbacks wired in, and is tracked in the registry under
/// the unique name `"<server>-<ip:port>#<id>"`. The registry is only
/// touched from the base loop; a connection closing anywhere hops back
/// here to deregister, then hops to its own loop for the final teardown.
pub struct TcpServer {
    me: Weak<TcpServer>,
    base_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Arc<EventLoopThreadPool>,
    started: AtomicUsize,
    next_conn_id: AtomicU64,
    connections: Mutex<IndexMap<String, Arc<TcpConnection>>>,
    callbacks: Mutex<ServerCallbacks>,
}

impl TcpServer {
    pub fn new(
        base_loop: Arc<EventLoop>,
        listen_addr: SocketAddrV4,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(base_loop.clone(), listen_addr, reuse_port)?;
        let thread_pool = Arc::new(EventLoopThreadPool::new(base_loop.clone(), name));

        let server = Arc::new_cyclic(|me: &Weak<TcpServer>| TcpServer {
            me: me.clone(),
            base_loop,
            name: name.to_string(),
            ip_port: listen_addr.to_string(),
            acceptor,
            thread_pool,
            started: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(IndexMap::new()),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let weak = server.me.clone();
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// Live connections currently in the registry.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.thread_pool.set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().thread_init = Some(Arc::new(callback));
    }

    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().connection = Some(Arc::new(callback));
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().message = Some(Arc::new(callback));
    }

    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().write_complete = Some(Arc::new(callback));
    }

    /// Starts the worker pool and the listener. Safe to call repeatedly,
    /// only the first call acts.
    pub fn start(&self) -> io::Result<()> {
        if self.started.fetch_add(1, Ordering::AcqRel) == 0 {
            let thread_init = self.callbacks.lock().unwrap().thread_init.clone();
            self.thread_pool.start(thread_init)?;

            let acceptor = self.acceptor.clone();
            self.base_loop.run_in_loop(move || acceptor.listen());
        }

        Ok(())
    }

    // Runs on the base loop, straight from the acceptor.
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddrV4) {
        let io_loop = self.thread_pool.get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        info!(
            "server {} accepted {} from {}",
            self.name, conn_name, peer_addr
        );

        // wildcard and ephemeral binds resolve per connection
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("failed to query local address of {}: {}", conn_name, e);
                SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
            }
        };

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );
        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        {
            let callbacks = self.callbacks.lock().unwrap();
            if let Some(callback) = &callbacks.connection {
                conn.set_connection_callback(callback.clone());
            }
            if let Some(callback) = &callbacks.message {
                conn.set_message_callback(callback.clone());
            }
            if let Some(callback) = &callbacks.write_complete {
                conn.set_write_complete_callback(callback.clone());
            }
        }

        let weak = self.me.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        io_loop.run_in_loop(move || conn.connect_established());
    }

    // May run on any loop; deregistration happens on the base loop. The
    // hop holds the server weakly so a task stranded in a stopped loop's
    // queue cannot keep the server alive past its owner.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let weak = self.me.clone();
        let conn = conn.clone();
        self.base_loop.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(&conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        info!("server {} removing {}", self.name, conn.name());

        self.connections.lock().unwrap().swap_remove(conn.name());

        // the captured strong reference keeps the connection alive across
        // the hop to its own loop
        let io_loop = conn.get_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // drain instead of erasing entry by entry mid-iteration
        let connections: Vec<Arc<TcpConnection>> = self
            .connections
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, conn)| conn)
            .collect();

        for conn in connections {
            let io_loop = conn.get_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
