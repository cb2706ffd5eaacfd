//! Bounded worker pool.
//!
//! A fixed set of named threads pulls job bodies from one bounded queue. Submission never
//! blocks: a full queue is reported back to the caller, which decides how to fail the
//! task. Each worker runs one job body at a time.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, info, warn};

/// A unit of work for the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Why the pool refused a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolRejected {
    #[error("worker queue is full")]
    Full,
    #[error("worker pool is shut down")]
    ShutDown,
}

#[derive(Debug, Default)]
struct PoolStats {
    queued: AtomicUsize,
    active: AtomicUsize,
}

pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    closed: AtomicBool,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers named `{name}-{n}` behind a queue of `capacity` jobs.
    pub fn spawn(name: impl Into<String>, threads: usize, capacity: usize) -> io::Result<Self> {
        let name = name.into();
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::sync_channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(PoolStats::default());

        let mut workers = Vec::with_capacity(threads.max(1));
        for n in 0..threads.max(1) {
            let rx = rx.clone();
            let stats = stats.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || worker_loop(rx, stats))?;
            workers.push(handle);
        }

        info!(pool = %name, threads = workers.len(), capacity, "worker pool started");

        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stats,
            closed: AtomicBool::new(false),
            capacity,
        })
    }

    /// Enqueue a job without blocking.
    pub fn try_execute(&self, job: Job) -> Result<(), PoolRejected> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(PoolRejected::ShutDown);
        };

        self.stats.queued.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.stats.queued.fetch_sub(1, Ordering::AcqRel);
                match err {
                    TrySendError::Full(_) => Err(PoolRejected::Full),
                    TrySendError::Disconnected(_) => Err(PoolRejected::ShutDown),
                }
            }
        }
    }

    /// Jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.stats.queued.load(Ordering::Acquire)
    }

    /// Jobs currently executing.
    pub fn active_count(&self) -> usize {
        self.stats.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, let workers drain the queue, and join them.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.name, "worker thread panicked");
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("queued", &self.queue_depth())
            .field("active", &self.active_count())
            .finish()
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>, stats: Arc<PoolStats>) {
    let name = thread::current().name().unwrap_or("worker").to_string();
    debug!(worker = %name, "worker started");

    loop {
        let job = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        let Ok(job) = job else {
            break;
        };

        stats.queued.fetch_sub(1, Ordering::AcqRel);
        stats.active.fetch_add(1, Ordering::AcqRel);
        // Job bodies catch their own panics; this keeps the worker alive regardless.
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            warn!(worker = %name, "job panicked outside its own handler");
        }
        stats.active.fetch_sub(1, Ordering::AcqRel);
    }

    debug!(worker = %name, "worker stopped");
}
