use std::io;
use std::sync::{Arc, Condvar, Mutex};

use crate::event_loop::EventLoop;
use crate::thread::Thread;

/// Runs once per pool thread, before its loop starts looping.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

// Hand-off slot between the spawned thread and start_loop.
struct Publication {
    slot: Mutex<Option<io::Result<Arc<EventLoop>>>>,
    cond: Condvar,
}

/// One-shot factory for an [`EventLoop`] living on its own thread.
///
/// `start_loop` spawns the thread, waits for the loop constructed inside
/// it to be published, and hands it back. Dropping the factory queues a
/// quit behind any pending work and joins the thread.
pub struct EventLoopThread {
    thread: Thread,
    publication: Arc<Publication>,
    event_loop: Option<Arc<EventLoop>>,
}

impl EventLoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: &str) -> EventLoopThread {
        let publication = Arc::new(Publication {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });

        let thread_publication = publication.clone();
        let thread = Thread::new(
            move || EventLoopThread::thread_func(thread_publication, init),
            name,
        );

        EventLoopThread {
            thread,
            publication,
            event_loop: None,
        }
    }

    /// Starts the thread and returns its loop.
    ///
    /// # Panics
    ///
    /// Panics when called twice; the factory is one-shot.
    pub fn start_loop(&mut self) -> io::Result<Arc<EventLoop>> {
        assert!(!self.thread.started(), "event loop thread started twice");
        self.thread.start()?;

        let mut slot = self.publication.slot.lock().unwrap();
        while slot.is_none() {
            slot = self.publication.cond.wait(slot).unwrap();
        }

        match slot.take() {
            Some(Ok(event_loop)) => {
                self.event_loop = Some(event_loop.clone());
                Ok(event_loop)
            }
            Some(Err(e)) => Err(e),
            None => unreachable!("publication slot emptied while locked"),
        }
    }

    fn thread_func(publication: Arc<Publication>, init: Option<ThreadInitCallback>) {
        let event_loop = match EventLoop::new() {
            Ok(event_loop) => event_loop,
            Err(e) => {
                *publication.slot.lock().unwrap() = Some(Err(e));
                publication.cond.notify_one();
                return;
            }
        };

        if let Some(init) = init {
            init(&event_loop);
        }

        *publication.slot.lock().unwrap() = Some(Ok(event_loop.clone()));
        publication.cond.notify_one();

        event_loop.run();
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            // queue the quit so tasks already submitted still drain
            let quit_loop = event_loop.clone();
            event_loop.queue_in_loop(move || quit_loop.quit());
            self.thread.join();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::EventLoopThread;

    #[test]
    fn start_loop_publishes_a_running_loop() {
        let mut factory = EventLoopThread::new(None, "loop-thread");
        let event_loop = factory.start_loop().unwrap();

        assert!(!event_loop.is_in_loop_thread());

        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = counter.clone();
        event_loop.run_in_loop(move || {
            task_counter.fetch_add(1, Ordering::Release);
        });

        // drop quits the loop behind the queued task and joins
        drop(factory);
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[test]
    fn init_callback_runs_on_the_loop_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let init_count = count.clone();

        let mut factory = EventLoopThread::new(
            Some(Arc::new(move |event_loop| {
                assert!(event_loop.is_in_loop_thread());
                init_count.fetch_add(1, Ordering::Release);
            })),
            "init-thread",
        );

        let _event_loop = factory.start_loop().unwrap();
        assert_eq!(count.load(Ordering::Acquire), 1);
    }
}
