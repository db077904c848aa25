//! Bounded pool of worker threads.
//!
//! Jobs are boxed closures pushed into a bounded channel; submission blocks
//! when the channel is full, which is the pipeline's backpressure. A shared
//! counter tracks outstanding jobs so the orchestrator can join between the
//! hashing phase and the delta phase. Once the cancellation token trips,
//! workers keep draining the channel but stop executing job bodies, so
//! [`WorkerPool::wait`] always returns.

use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::cancel::Cancellation;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default worker count: half the available parallelism, at least one.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

struct Outstanding {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Outstanding {
    fn increment(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }
}

/// Fixed-size pool of long-lived worker threads.
pub struct WorkerPool {
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
    outstanding: Arc<Outstanding>,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one) draining a channel with the
    /// same capacity.
    pub fn new(workers: usize, cancel: Cancellation) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job>(workers);
        let receiver = Arc::new(Mutex::new(receiver));
        let outstanding = Arc::new(Outstanding {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });

        let handles = (0..workers)
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                let outstanding = Arc::clone(&outstanding);
                let cancel = cancel.clone();
                thread::spawn(move || worker_loop(&receiver, &outstanding, &cancel))
            })
            .collect();

        Self {
            sender: Some(sender),
            workers: handles,
            outstanding,
        }
    }

    /// Queue a job, blocking while the channel is full.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.outstanding.increment();
        let sender = self.sender.as_ref().expect("worker pool already shut down");
        if sender.send(Box::new(job)).is_err() {
            // Workers are gone; the job will never run.
            self.outstanding.decrement();
        }
    }

    /// Block until every submitted job has been taken off the queue and
    /// either executed or discarded due to cancellation.
    pub fn wait(&self) {
        let mut count = self.outstanding.count.lock().unwrap();
        while *count > 0 {
            count = self.outstanding.drained.wait(count).unwrap();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel terminates the worker loops.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>, outstanding: &Outstanding, cancel: &Cancellation) {
    loop {
        let job = match receiver.lock().unwrap().recv() {
            Ok(job) => job,
            Err(_) => return,
        };

        if !cancel.is_cancelled() {
            job();
        }

        outstanding.decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_all_jobs() {
        let pool = WorkerPool::new(4, Cancellation::new());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn zero_workers_is_clamped_to_one() {
        let pool = WorkerPool::new(0, Cancellation::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let clone = Arc::clone(&counter);
        pool.submit(move || {
            clone.fetch_add(1, Ordering::SeqCst);
        });

        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_skips_queued_jobs_but_wait_returns() {
        let cancel = Cancellation::new();
        let pool = WorkerPool::new(2, cancel.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        cancel.cancel();
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wait_joins_slow_jobs() {
        let pool = WorkerPool::new(2, Cancellation::new());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn wait_can_be_called_between_phases() {
        let pool = WorkerPool::new(2, Cancellation::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let clone = Arc::clone(&counter);
        pool.submit(move || {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let clone = Arc::clone(&counter);
        pool.submit(move || {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
