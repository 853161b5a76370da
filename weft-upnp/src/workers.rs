//! The pool of threads that run accepted connections
//!
//! The accept loop must never block on a slow client, so each accepted
//! connection becomes a job handled on one of a fixed number of worker
//! threads. Jobs queue when all workers are busy.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(count: usize) -> WorkerPool {
        assert!(count > 0);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let threads = (0..count)
            .map(|n| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("weft-worker-{n}"))
                    .spawn(move || loop {
                        // Sender gone means shutdown
                        let job = {
                            let guard = receiver.lock().unwrap();
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("spawning worker thread")
            })
            .collect();
        WorkerPool {
            sender: Some(sender),
            threads,
        }
    }

    /// Queue a job; false if the pool is shutting down
    pub(crate) fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .is_some_and(|s| s.send(Box::new(job)).is_ok())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel unblocks every idle worker
        drop(self.sender.take());
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_jobs_on_workers() {
        let pool = WorkerPool::new(3);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let count = count.clone();
            assert!(pool.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 20 {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn drop_waits_for_queued_jobs() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(1);
            for _ in 0..5 {
                let count = count.clone();
                pool.execute(move || {
                    thread::sleep(Duration::from_millis(10));
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        // all jobs ran before drop returned
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
