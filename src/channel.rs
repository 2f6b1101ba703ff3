use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::trace;

use crate::event_loop::EventLoop;

// Classification of a channel inside its poller:
// not in the map, in the map and registered, or in the map but unregistered.
pub(crate) const INDEX_NEW: u8 = 0;
pub(crate) const INDEX_ADDED: u8 = 1;
pub(crate) const INDEX_DELETED: u8 = 2;

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const HUP: u8 = 0b1000;

/// Interest and raised-event bits for one channel.
///
/// A channel only ever asks for readable and writable; error and hup
/// arrive unrequested from the poller, so they show up in raised sets
/// only. A raised set where hup stands alone carries no data and routes
/// the dispatch straight into the close path.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ready(u8);

impl Ready {
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    pub fn error() -> Ready {
        Ready(ERROR)
    }

    pub fn hup() -> Ready {
        Ready(HUP)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    pub fn is_hup(self) -> bool {
        self.0 & HUP != 0
    }

    /// The peer hung up and left nothing behind to read.
    pub fn is_close_only(self) -> bool {
        self.is_hup() && !self.is_readable()
    }

    /// This set plus everything in `other`.
    pub fn with(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }

    /// This set minus everything in `other`.
    pub fn without(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return fmt.write_str("(none)");
        }

        let mut sep = "";
        for (bit, name) in [
            (READABLE, "readable"),
            (WRITABLE, "writable"),
            (ERROR, "error"),
            (HUP, "hup"),
        ] {
            if self.0 & bit != 0 {
                write!(fmt, "{}{}", sep, name)?;
                sep = "+";
            }
        }

        Ok(())
    }
}

/// Receiver of the events a [`Channel`] dispatches.
///
/// The channel holds a `Weak` reference to its handler and upgrades it per
/// dispatch, so an implementor is kept alive for the duration of every
/// handler invocation even if its last external owner lets go concurrently.
/// Events a handler does not arm can keep the default empty bodies.
pub trait EventHandler: Send + Sync {
    fn handle_read(self: Arc<Self>, _receive_time: Instant) {}

    fn handle_write(self: Arc<Self>) {}

    fn handle_close(self: Arc<Self>) {}

    fn handle_error(self: Arc<Self>) {}
}

/// Binds one descriptor to its interest set and event handler within an
/// event loop.
///
/// A channel never owns its descriptor. Interest changes go through
/// `update()` to the owning loop's poller; `remove()` deregisters the
/// channel, and must happen before the channel is dropped.
///
/// Interest, raised events and the poller index are only written from the
/// owning loop's thread; they are atomics so the channel can live inside
/// objects that are shared across threads.
pub struct Channel {
    me: Weak<Channel>,
    fd: RawFd,
    event_loop: Weak<EventLoop>,
    events: AtomicU8,
    revents: AtomicU8,
    index: AtomicU8,
    handler: Mutex<Option<Weak<dyn EventHandler>>>,
}

impl Channel {
    pub fn new(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|me| Channel {
            me: me.clone(),
            fd,
            event_loop,
            events: AtomicU8::new(0),
            revents: AtomicU8::new(0),
            index: AtomicU8::new(INDEX_NEW),
            handler: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> Ready {
        Ready(self.events.load(Ordering::Relaxed))
    }

    pub fn revents(&self) -> Ready {
        Ready(self.revents.load(Ordering::Relaxed))
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.revents.store(revents.0, Ordering::Relaxed);
    }

    pub(crate) fn set_events(&self, events: Ready) {
        self.events.store(events.0, Ordering::Relaxed);
    }

    pub(crate) fn index(&self) -> u8 {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: u8) {
        self.index.store(index, Ordering::Relaxed);
    }

    pub fn is_none_event(&self) -> bool {
        self.events().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.events().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.events().is_writable()
    }

    /// Installs the handler the channel dispatches to. The weak reference
    /// is what keeps dispatch safe against a concurrently dropped owner.
    pub fn tie(&self, handler: Weak<dyn EventHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn enable_reading(&self) {
        self.set_events(self.events().with(Ready::readable()));
        self.update();
    }

    pub fn disable_reading(&self) {
        self.set_events(self.events().without(Ready::readable()));
        self.update();
    }

    pub fn enable_writing(&self) {
        self.set_events(self.events().with(Ready::writable()));
        self.update();
    }

    pub fn disable_writing(&self) {
        self.set_events(self.events().without(Ready::writable()));
        self.update();
    }

    pub fn disable_all(&self) {
        self.set_events(Ready::empty());
        self.update();
    }

    /// Deregisters the channel from its poller. Must run before drop.
    pub fn remove(&self) {
        if let (Some(me), Some(event_loop)) = (self.me.upgrade(), self.event_loop.upgrade()) {
            event_loop.remove_channel(&me);
        }
    }

    fn update(&self) {
        if let (Some(me), Some(event_loop)) = (self.me.upgrade(), self.event_loop.upgrade()) {
            event_loop.update_channel(&me);
        }
    }

    /// Dispatches the raised events to the tied handler.
    ///
    /// The weak handler is upgraded first; if the owner is already gone the
    /// raised events are dropped on the floor.
    pub fn handle_event(&self, receive_time: Instant) {
        let handler = {
            let guard = self.handler.lock().unwrap();
            match guard.as_ref().and_then(Weak::upgrade) {
                Some(handler) => handler,
                None => return,
            }
        };

        let revents = self.revents();
        trace!("channel fd = {} dispatching {:?}", self.fd, revents);

        if revents.is_close_only() {
            handler.handle_close();
            return;
        }

        if revents.is_error() {
            handler.clone().handle_error();
        }

        if revents.is_readable() {
            handler.clone().handle_read(receive_time);
        }

        if revents.is_writable() {
            handler.handle_write();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(
            self.index.load(Ordering::Relaxed) == INDEX_NEW,
            "channel fd = {} dropped while still known to its poller",
            self.fd
        );
    }
}
