use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use log::error;

static NUM_CREATED: AtomicUsize = AtomicUsize::new(0);

/// An owned OS thread that publishes its identifier synchronously.
///
/// `start` does not return until the spawned thread has reported its
/// `ThreadId`, so callers can rely on [`tid`](Thread::tid) right away. A
/// started thread that is never joined is detached on drop.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    func: Option<Box<dyn FnOnce() + Send + 'static>>,
    tid: Option<ThreadId>,
    name: String,
    started: bool,
}

impl Thread {
    /// Wraps `func` under `name`; an empty name gets a generated
    /// `Thread<n>` one.
    pub fn new<F>(func: F, name: &str) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let num = NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1;
        let name = if name.is_empty() {
            format!("Thread{}", num)
        } else {
            name.to_string()
        };

        Thread {
            handle: None,
            func: Some(Box::new(func)),
            tid: None,
            name,
            started: false,
        }
    }

    /// Spawns the thread and blocks until its identifier is published.
    pub fn start(&mut self) -> io::Result<()> {
        assert!(!self.started, "thread {} started twice", self.name);
        self.started = true;

        let func = match self.func.take() {
            Some(func) => func,
            None => return Ok(()),
        };

        let (tx, rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _ = tx.send(thread::current().id());
                func();
            })?;

        self.handle = Some(handle);

        if let Ok(tid) = rx.recv() {
            self.tid = Some(tid);
        }

        Ok(())
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread {} panicked", self.name);
            }
        }
    }

    pub fn tid(&self) -> Option<ThreadId> {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;

    use super::Thread;

    #[test]
    fn publishes_tid_before_start_returns() {
        let (tx, rx) = mpsc::channel();
        let mut thread = Thread::new(
            move || {
                let _ = tx.send(std::thread::current().id());
            },
            "publisher",
        );

        thread.start().unwrap();
        let published = thread.tid().expect("tid available after start");
        thread.join();

        assert_eq!(published, rx.recv().unwrap());
    }

    #[test]
    fn runs_the_supplied_function() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let mut thread = Thread::new(move || flag.store(true, Ordering::Release), "");
        assert!(thread.name().starts_with("Thread"));

        thread.start().unwrap();
        thread.join();

        assert!(ran.load(Ordering::Acquire));
    }
}
