use std::env;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{debug, error, trace, warn};

use crate::channel::{Channel, INDEX_ADDED, INDEX_DELETED, INDEX_NEW};
use crate::sys;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Owns the readiness facility of one event loop and the map from
/// registered descriptors to their channels.
///
/// Map and registration set move in lockstep: every mapped channel with a
/// non-empty interest and an `ADDED` index is registered with epoll, a
/// `DELETED` channel stays mapped but unregistered. All methods are called
/// from the owning loop's thread only.
pub struct Poller {
    epoll: sys::Epoll,
    channels: IndexMap<RawFd, Arc<Channel>>,
    events: sys::Events,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: sys::Epoll::new()?,
            channels: IndexMap::new(),
            events: sys::Events::with_capacity(INIT_EVENT_LIST_SIZE),
        })
    }

    /// Backend factory. `HIVE_IO_USE_POLL` is reserved for a poll(2)
    /// backend; none is built in, so epoll is returned either way.
    pub fn new_default() -> io::Result<Poller> {
        if env::var_os("HIVE_IO_USE_POLL").is_some() {
            warn!("HIVE_IO_USE_POLL is set but no poll(2) backend is available, using epoll");
        }

        Poller::new()
    }

    /// Waits for readiness, appends the active channels with their raised
    /// events set, and returns the post-wait timestamp.
    pub fn poll(&mut self, timeout: Duration, active_channels: &mut Vec<Arc<Channel>>) -> Instant {
        let result = self.epoll.wait(&mut self.events, Some(timeout));
        let now = Instant::now();

        match result {
            Ok(0) => debug!("nothing happened within {:?}", timeout),
            Ok(n) => {
                trace!("{} events happened", n);
                self.fill_active_channels(active_channels);
                if n == self.events.capacity() {
                    self.events = sys::Events::with_capacity(n * 2);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!("poller wait failed: {}", e),
        }

        now
    }

    fn fill_active_channels(&self, active_channels: &mut Vec<Arc<Channel>>) {
        for i in 0..self.events.len() {
            if let Some((fd, ready)) = self.events.get(i) {
                // a channel removed in the same iteration may still be
                // reported, the map lookup drops such strays
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(ready);
                    active_channels.push(channel.clone());
                }
            }
        }
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        trace!(
            "update channel: fd = {}, events = {:?}, index = {}",
            channel.fd(),
            channel.events(),
            index
        );

        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                self.channels.insert(channel.fd(), channel.clone());
            }

            channel.set_index(INDEX_ADDED);
            if let Err(e) = self.epoll.add(channel.fd(), channel.events()) {
                error!("failed to register fd {} with epoll: {}", channel.fd(), e);
                panic!("epoll registration failed for fd {}: {}", channel.fd(), e);
            }
        } else if channel.is_none_event() {
            // no interest left, take it off epoll but keep it mapped
            if let Err(e) = self.epoll.delete(channel.fd()) {
                error!("failed to unregister fd {} from epoll: {}", channel.fd(), e);
            }
            channel.set_index(INDEX_DELETED);
        } else if let Err(e) = self.epoll.modify(channel.fd(), channel.events()) {
            error!("failed to modify fd {} in epoll: {}", channel.fd(), e);
            panic!("epoll modification failed for fd {}: {}", channel.fd(), e);
        }
    }

    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("remove channel: fd = {}", fd);

        self.channels.swap_remove(&fd);

        if channel.index() == INDEX_ADDED {
            if let Err(e) = self.epoll.delete(fd) {
                error!("failed to unregister fd {} from epoll: {}", fd, e);
            }
        }

        channel.set_index(INDEX_NEW);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |found| Arc::ptr_eq(found, channel))
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::AsRawFd;
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use crate::channel::{Channel, Ready, INDEX_ADDED, INDEX_DELETED, INDEX_NEW};
    use crate::sys::EventFd;

    use super::Poller;

    fn detached_channel(fd: i32) -> Arc<Channel> {
        Channel::new(Weak::new(), fd)
    }

    #[test]
    fn map_and_registration_stay_consistent() {
        let mut poller = Poller::new().unwrap();
        let eventfd = EventFd::new().unwrap();
        let channel = detached_channel(eventfd.as_raw_fd());

        assert_eq!(channel.index(), INDEX_NEW);
        assert!(!poller.has_channel(&channel));

        channel.set_events(Ready::readable());
        poller.update_channel(&channel);
        assert_eq!(channel.index(), INDEX_ADDED);
        assert!(poller.has_channel(&channel));

        // dropping all interest unregisters but keeps the map entry
        channel.set_events(Ready::empty());
        poller.update_channel(&channel);
        assert_eq!(channel.index(), INDEX_DELETED);
        assert!(poller.has_channel(&channel));

        // re-arming re-registers the mapped channel
        channel.set_events(Ready::readable());
        poller.update_channel(&channel);
        assert_eq!(channel.index(), INDEX_ADDED);

        poller.remove_channel(&channel);
        assert_eq!(channel.index(), INDEX_NEW);
        assert!(!poller.has_channel(&channel));

        // removing again is a no-op
        poller.remove_channel(&channel);
        assert_eq!(channel.index(), INDEX_NEW);
    }

    #[test]
    fn poll_reports_raised_events() {
        let mut poller = Poller::new().unwrap();
        let eventfd = EventFd::new().unwrap();
        let channel = detached_channel(eventfd.as_raw_fd());

        channel.set_events(Ready::readable());
        poller.update_channel(&channel);

        let mut active = Vec::new();
        poller.poll(Duration::from_millis(0), &mut active);
        assert!(active.is_empty());

        eventfd.write(1).unwrap();

        poller.poll(Duration::from_millis(100), &mut active);
        assert_eq!(active.len(), 1);
        assert!(Arc::ptr_eq(&active[0], &channel));
        assert!(active[0].revents().is_readable());

        poller.remove_channel(&channel);
    }

    #[test]
    fn removed_channel_is_not_reported() {
        let mut poller = Poller::new().unwrap();
        let eventfd = EventFd::new().unwrap();
        let channel = detached_channel(eventfd.as_raw_fd());

        channel.set_events(Ready::readable());
        poller.update_channel(&channel);
        eventfd.write(1).unwrap();
        poller.remove_channel(&channel);

        let mut active = Vec::new();
        poller.poll(Duration::from_millis(0), &mut active);
        assert!(active.is_empty());
    }
}
