use std::cell::Cell;
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, info};

use crate::channel::{Channel, EventHandler, Ready};
use crate::poller::Poller;
use crate::sys::EventFd;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = Cell::new(false);
}

/// One reactor, pinned to one OS thread.
///
/// The loop owns a poller, a wakeup eventfd with its channel, and a
/// mutex-protected task queue. Any thread may submit work with
/// [`run_in_loop`](EventLoop::run_in_loop) or
/// [`queue_in_loop`](EventLoop::queue_in_loop); everything else, channels
/// included, belongs to the loop's own thread. At most one `EventLoop` may
/// exist per thread, enforced at construction.
pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    poller: Mutex<Poller>,
    poll_return_time: Mutex<Instant>,
    wakeup_fd: EventFd,
    wakeup_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates the loop for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already owns a live `EventLoop`.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        let poller = Poller::new_default()?;
        let wakeup_fd = EventFd::new()?;
        let wakeup_raw = wakeup_fd.as_raw_fd();

        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                error!(
                    "another event loop already exists on thread {:?}",
                    thread::current().id()
                );
                panic!("one event loop per thread");
            }
            flag.set(true);
        });

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            poller: Mutex::new(poller),
            poll_return_time: Mutex::new(Instant::now()),
            wakeup_channel: Channel::new(weak.clone(), wakeup_raw),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
        });

        let handler: Arc<dyn EventHandler> = event_loop.clone();
        event_loop.wakeup_channel.tie(Arc::downgrade(&handler));
        event_loop.wakeup_channel.enable_reading();

        info!("event loop created on thread {:?}", event_loop.thread_id);

        Ok(event_loop)
    }

    /// Runs the loop until [`quit`](EventLoop::quit): wait for readiness,
    /// dispatch every active channel, then drain the pending tasks.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one that created
    /// the loop.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "an event loop must run on its own thread"
        );

        self.looping.store(true, Ordering::Release);
        self.quit.store(false, Ordering::Release);
        info!("event loop on {:?} starts looping", self.thread_id);

        let mut active_channels: Vec<Arc<Channel>> = Vec::new();

        while !self.quit.load(Ordering::Acquire) {
            active_channels.clear();

            let poll_time = self
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIMEOUT, &mut active_channels);
            *self.poll_return_time.lock().unwrap() = poll_time;

            for channel in &active_channels {
                channel.handle_event(poll_time);
            }

            self.do_pending_tasks();
        }

        info!("event loop on {:?} stops looping", self.thread_id);
        self.looping.store(false, Ordering::Release);
    }

    /// Asks the loop to return from its next iteration. A quit from a
    /// foreign thread also wakes the loop out of its poll.
    ///
    /// Tasks already queued may or may not run before the loop exits;
    /// callers that need a drain-then-quit should queue the quit itself as
    /// a task.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` inline when called on the loop's thread, otherwise
    /// queues it.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue.
    ///
    /// The loop is woken when the caller is on a foreign thread, or when
    /// the loop is currently draining tasks, so a task queued from inside a
    /// task does not wait out a full poll interval.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().unwrap().push(Box::new(task));

        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Forces the next poll to return by bumping the wakeup eventfd.
    pub fn wakeup(&self) {
        if let Err(e) = self.wakeup_fd.write(1) {
            error!("event loop wakeup failed: {}", e);
        }
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.poller.lock().unwrap().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.poller.lock().unwrap().has_channel(channel)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Timestamp taken right after the last poll returned.
    pub fn poll_return_time(&self) -> Instant {
        *self.poll_return_time.lock().unwrap()
    }

    // Swap the queue out under the lock and run the tasks without it, so a
    // task is free to call queue_in_loop on this same loop.
    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);

        let tasks = mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }

        self.calling_pending.store(false, Ordering::Release);
    }
}

impl EventHandler for EventLoop {
    // wakeup channel readable: discard the eventfd counter
    fn handle_read(self: Arc<Self>, _receive_time: Instant) {
        if let Err(e) = self.wakeup_fd.read() {
            error!("event loop wakeup read failed: {}", e);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.set_events(Ready::empty());
        self.poller
            .lock()
            .unwrap()
            .remove_channel(&self.wakeup_channel);

        if thread::current().id() == self.thread_id {
            LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use super::EventLoop;

    #[test]
    #[should_panic(expected = "one event loop per thread")]
    fn two_loops_on_one_thread() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new();
    }

    #[test]
    fn run_in_loop_is_inline_on_the_loop_thread() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        event_loop.run_in_loop(move || flag.store(true, Ordering::Release));

        // executed synchronously, no run() needed
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn quit_as_task_drains_the_queue() {
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            event_loop.queue_in_loop(move || order.lock().unwrap().push(i));
        }

        let quit_loop = event_loop.clone();
        event_loop.queue_in_loop(move || quit_loop.quit());

        // queueing from the loop thread before run() does not wake the
        // poll, kick it explicitly
        event_loop.wakeup();
        event_loop.run();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn foreign_tasks_run_in_submission_order() {
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let submitter_loop = event_loop.clone();
        let submitter_order = order.clone();
        let submitter = thread::spawn(move || {
            for i in 0..100 {
                let order = submitter_order.clone();
                submitter_loop.run_in_loop(move || order.lock().unwrap().push(i));
            }
            let quit_loop = submitter_loop.clone();
            submitter_loop.queue_in_loop(move || quit_loop.quit());
        });

        event_loop.run();
        submitter.join().unwrap();

        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn queue_during_drain_wakes_the_loop() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let outer_loop = event_loop.clone();
        let flag = ran.clone();
        event_loop.queue_in_loop(move || {
            // queued mid-drain: must still run before the quit below stops
            // the loop, without waiting out a poll interval
            let flag = flag.clone();
            let inner_loop = outer_loop.clone();
            outer_loop.queue_in_loop(move || {
                flag.store(true, Ordering::Release);
                inner_loop.quit();
            });
        });

        event_loop.wakeup();
        event_loop.run();

        assert!(ran.load(Ordering::Acquire));
    }
}
