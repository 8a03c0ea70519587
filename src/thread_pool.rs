//! A small shared-queue thread pool.
//!
//! The pool feeds a fixed set of worker threads from one MPMC [`channel`]
//! provided by the crossbeam crate, used here as single producer, multiple
//! consumer. If a spawned task panics, the dying worker replaces itself
//! with a fresh thread, so the pool does not silently shrink.
//!
//! [`channel`]: https://docs.rs/crossbeam/0.8/crossbeam/channel/index.html

use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error};

use crate::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The interface of a pool that runs closures on background threads
pub trait ThreadPool {
    /// creates a pool with the given number of `threads`
    ///
    /// # Errors
    /// returns an error when an OS thread could not be spawned
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// schedules a job onto the pool
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

/// A thread pool with a shared crossbeam job queue.
///
/// Dropping the pool closes the queue; [`SharedQueueThreadPool::shutdown`]
/// additionally waits until every queued job has run, which the backup
/// scheduler relies on to flush outstanding snapshots before exit.
pub struct SharedQueueThreadPool {
    // present until shutdown; taking it closes the channel
    tx: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(threads as usize);
        for _ in 0..threads {
            let task_rx = TaskReceiver(rx.clone());
            handles.push(thread::Builder::new().spawn(move || run_tasks(task_rx))?);
        }
        Ok(SharedQueueThreadPool {
            tx: Some(tx),
            handles,
        })
    }

    /// Schedules a job onto the pool.
    ///
    /// # Panics
    /// Panics if the pool has already been shut down.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .as_ref()
            .expect("thread pool was shut down")
            .send(Box::new(job))
            .expect("there are no threads in the pool");
    }
}

impl SharedQueueThreadPool {
    /// Closes the queue and joins the workers; every job already queued
    /// finishes before this returns.
    pub fn shutdown(mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("pool worker panicked during shutdown");
            }
        }
    }
}

/// A type that can receive tasks (i.e. closures) from a channel and run
/// them. Additionally, this type is responsible for restarting any threads
/// that panicked.
#[derive(Clone)]
struct TaskReceiver(Receiver<Job>);

impl Drop for TaskReceiver {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("pool worker panicked, starting a replacement thread");
            let task_rx = self.clone();
            if let Err(e) = thread::Builder::new().spawn(move || run_tasks(task_rx)) {
                error!("failed to spawn a replacement thread: {}", e);
            }
        }
    }
}

/// waits for tasks on the (wrapped) receiver and runs them until the queue
/// is closed
fn run_tasks(rx: TaskReceiver) {
    loop {
        match rx.0.recv() {
            Ok(task) => task(),
            Err(_) => {
                debug!("pool worker exiting, queue closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn runs_every_queued_job_before_shutdown_returns() {
        let pool = SharedQueueThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn survives_a_panicking_job() {
        let pool = SharedQueueThreadPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.spawn(|| panic!("job blew up"));
        thread::sleep(Duration::from_millis(50));
        let counter2 = Arc::clone(&counter);
        pool.spawn(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
