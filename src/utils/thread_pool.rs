//! Fixed-size worker pool for scan-match jobs and optimization work.
//!
//! Jobs are closures pushed onto a crossbeam channel and picked up by a
//! fixed set of worker threads. The pool is shared between the
//! constraint builder and the pose graph's optimization barrier; it must
//! never be used to run pose-graph writers, which are serialized by the
//! graph's own lock.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A shared pool of worker threads.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `num_threads` workers (at least one).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (sender, receiver) = unbounded::<Job>();

        let workers = (0..num_threads)
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("setu-worker-{i}"))
                    .spawn(move || {
                        // Channel disconnect is the shutdown signal.
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Schedule a job. Jobs run in submission order per worker but may
    /// interleave across workers.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .expect("thread pool already shut down")
            .send(Box::new(job))
            .expect("worker threads gone");
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Disconnect the channel, then wait for workers to drain it.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
