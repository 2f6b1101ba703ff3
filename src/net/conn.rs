use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{error, info, warn};

use crate::buffer::Buffer;
use crate::channel::{Channel, EventHandler};
use crate::event_loop::EventLoop;
use crate::sys::Socket;

/// Invoked on establish and on teardown; tell them apart with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked with whatever bytes arrived, and the poll timestamp they
/// arrived at.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
/// Invoked once each time the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked with the buffered output size when one send pushes it across
/// the high-water threshold.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle. Transitions only move forward:
/// `Connecting → Connected → (Disconnecting) → Disconnected`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One established connection, pinned to one worker loop.
///
/// The connection is always held behind an `Arc`: the server registry
/// keeps one strong reference, the channel keeps a weak one that each
/// dispatch upgrades, and every callback receives a strong one. A handler
/// may therefore drop the registry entry mid-flight; the object survives
/// until the dispatch frame lets go, and is destroyed on its own loop's
/// thread.
///
/// Buffers and channel interest are only touched from the owning loop;
/// the state field is atomic so foreign threads can cheaply observe
/// `connected()` before queueing work.
pub struct TcpConnection {
    me: Weak<TcpConnection>,
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddrV4,
    peer_addr: SocketAddrV4,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddrV4,
        peer_addr: SocketAddrV4,
    ) -> Arc<TcpConnection> {
        if let Err(e) = socket.set_keep_alive(true) {
            warn!("connection {} failed to enable keepalive: {}", name, e);
        }

        let channel = Channel::new(Arc::downgrade(&event_loop), socket.fd());
        info!("connection {} created, fd = {}", name, socket.fd());

        Arc::new_cyclic(|me| TcpConnection {
            me: me.clone(),
            event_loop,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer_addr
    }

    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    // The shared-self primitive: recover a strong reference for queued
    // tasks and callback parameters. Fails only mid-destruction.
    fn shared(&self) -> Option<Arc<TcpConnection>> {
        self.me.upgrade()
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.socket.set_tcp_no_delay(on) {
            warn!("connection {} failed to toggle nodelay: {}", self.name, e);
        }
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(callback);
    }

    /// Arms backpressure: `callback` fires when a single send lifts the
    /// buffered output from below `high_water_mark` to at or above it.
    pub fn set_high_water_mark_callback<F>(&self, callback: F, high_water_mark: usize)
    where
        F: Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    {
        self.high_water_mark
            .store(high_water_mark, Ordering::Relaxed);
        self.callbacks.lock().unwrap().high_water_mark = Some(Arc::new(callback));
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(callback);
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().unwrap().connection.clone()
    }

    fn message_callback(&self) -> Option<MessageCallback> {
        self.callbacks.lock().unwrap().message.clone()
    }

    fn write_complete_callback(&self) -> Option<WriteCompleteCallback> {
        self.callbacks.lock().unwrap().write_complete.clone()
    }

    fn high_water_mark_callback(&self) -> Option<HighWaterMarkCallback> {
        self.callbacks.lock().unwrap().high_water_mark.clone()
    }

    fn close_callback(&self) -> Option<CloseCallback> {
        self.callbacks.lock().unwrap().close.clone()
    }

    /// Sends `data`, from any thread.
    ///
    /// Outside the loop thread the bytes are copied into the queued task,
    /// so the caller's buffer need not outlive the call. Anything but a
    /// connected state drops the payload with a log line.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            warn!(
                "connection {} is not connected, dropping {} bytes",
                self.name,
                data.len()
            );
            return;
        }

        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else if let Some(conn) = self.shared() {
            let data = data.to_vec();
            self.event_loop
                .run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            warn!(
                "connection {} is disconnected, giving up the write",
                self.name
            );
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        let mut output = self.output_buffer.lock().unwrap();

        // nothing in flight: try to push the payload out directly
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let (Some(conn), Some(callback)) =
                            (self.shared(), self.write_complete_callback())
                        {
                            self.event_loop.queue_in_loop(move || callback(&conn));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("connection {} write failed: {}", self.name, e);
                        if let Some(errno) = e.raw_os_error() {
                            if errno == libc::EPIPE || errno == libc::ECONNRESET {
                                fault = true;
                            }
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);

            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                if let (Some(conn), Some(callback)) =
                    (self.shared(), self.high_water_mark_callback())
                {
                    let size = old_len + remaining;
                    self.event_loop.queue_in_loop(move || callback(&conn, size));
                }
            }

            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close: stop writing once the buffered output drains, keep
    /// reading until the peer closes. A no-op outside the connected state.
    pub fn shutdown(&self) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            if let Some(conn) = self.shared() {
                self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
            }
        }
    }

    fn shutdown_in_loop(&self) {
        // still write-armed means unsent data, handle_write finishes the job
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!(
                    "connection {} failed to shut down writing: {}",
                    self.name, e
                );
            }
        }
    }

    /// Completes establishment on the owning loop: ties the channel, arms
    /// reading and announces the connection.
    pub fn connect_established(&self) {
        self.set_state(ConnState::Connected);

        if let Some(conn) = self.shared() {
            let handler: Arc<dyn EventHandler> = conn.clone();
            self.channel.tie(Arc::downgrade(&handler));
            self.channel.enable_reading();

            if let Some(callback) = self.connection_callback() {
                callback(&conn);
            }
        }
    }

    /// Final teardown on the owning loop. Idempotent: a connection that
    /// already went through the close path only has its channel removed.
    pub fn connect_destroyed(&self) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();

            if let (Some(conn), Some(callback)) = (self.shared(), self.connection_callback()) {
                callback(&conn);
            }
        }

        self.channel.remove();
    }
}

impl EventHandler for TcpConnection {
    fn handle_read(self: Arc<Self>, receive_time: Instant) {
        let mut input = self.input_buffer.lock().unwrap();

        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                if let Some(callback) = self.message_callback() {
                    callback(&self, &mut input, receive_time);
                }
            }
            Err(e) => {
                error!("connection {} read failed: {}", self.name, e);
                drop(input);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: Arc<Self>) {
        if !self.channel.is_writing() {
            warn!(
                "connection {} is down, fd = {} writes no more",
                self.name,
                self.channel.fd()
            );
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match output.write_fd(self.channel.fd()) {
            Ok(n) => {
                output.retrieve(n);

                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();

                    if let Some(callback) = self.write_complete_callback() {
                        let conn = self.clone();
                        self.event_loop.queue_in_loop(move || callback(&conn));
                    }

                    if self.state() == ConnState::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => error!("connection {} write failed: {}", self.name, e),
        }
    }

    fn handle_close(self: Arc<Self>) {
        info!(
            "connection {} closing, fd = {}, state = {:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );

        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        // hold a strong reference across both callbacks, the close
        // callback is about to drop the registry entry
        let conn = self.clone();
        if let Some(callback) = self.connection_callback() {
            callback(&conn);
        }
        if let Some(callback) = self.close_callback() {
            callback(&conn);
        }
    }

    fn handle_error(self: Arc<Self>) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("connection {} error: {}", self.name, e),
            Ok(None) => error!("connection {} error with no pending code", self.name),
            Err(e) => error!(
                "connection {} error, and fetching it failed too: {}",
                self.name, e
            ),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        info!(
            "connection {} destroyed, fd = {}, state = {:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
    }
}

#[cfg(test)]
mod test {
    use super::ConnState;

    #[test]
    fn state_round_trip() {
        for state in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Disconnecting,
            ConnState::Disconnected,
        ] {
            assert_eq!(ConnState::from_u8(state as u8), state);
        }
    }
}
