use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};

/// A pool of worker event loops behind one accept loop.
///
/// The application-owned `base_loop` is both the fallback when the pool is
/// empty and the loop the acceptor runs on. Workers are named
/// `<name><index>` and handed out round-robin.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    event_loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            event_loops: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads to spawn on `start`; 0 leaves all I/O on
    /// the base loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    pub fn start(&self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        self.started.store(true, Ordering::Release);

        let num_threads = self.num_threads.load(Ordering::Relaxed);
        let mut threads = self.threads.lock().unwrap();
        let mut event_loops = self.event_loops.lock().unwrap();

        for i in 0..num_threads {
            let name = format!("{}{}", self.name, i);
            let mut thread = EventLoopThread::new(init.clone(), &name);
            event_loops.push(thread.start_loop()?);
            threads.push(thread);
        }
        info!("thread pool {} started {} workers", self.name, num_threads);

        // single-reactor setup: the init callback still runs, on the base loop
        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }

        Ok(())
    }

    /// Round-robins over the workers; the base loop when there are none.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        let event_loops = self.event_loops.lock().unwrap();

        if event_loops.is_empty() {
            return self.base_loop.clone();
        }

        let next = self.next.fetch_add(1, Ordering::Relaxed);
        event_loops[next % event_loops.len()].clone()
    }

    /// All worker loops, or the base loop alone for an empty pool.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        let event_loops = self.event_loops.lock().unwrap();

        if event_loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            event_loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
