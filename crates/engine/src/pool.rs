//! Fixed worker pool with a FIFO job queue.
//!
//! Serves asynchronous reads and writes, and (with a single thread) backs the
//! owning-thread executor. Jobs run in submission order per worker; a
//! panicking job is logged and does not take its worker down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use custodian_core::{AccessError, AccessResult};
use parking_lot::{Condvar, Mutex};
use tracing::error;

type Job = Box<dyn FnOnce() + Send>;

/// Pool metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs waiting in the queue.
    pub queue_depth: usize,
    /// Jobs currently executing.
    pub active_tasks: usize,
    /// Jobs completed since creation.
    pub tasks_completed: u64,
    /// Number of worker threads.
    pub worker_count: usize,
}

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    tasks_completed: AtomicU64,
}

impl PoolInner {
    fn push(&self, job: Job) -> AccessResult<()> {
        // Reject after shutdown: workers may already have exited
        if self.shutdown.load(Ordering::Acquire) {
            return Err(AccessError::Disposed);
        }
        {
            let mut queue = self.queue.lock();
            queue.push_back(job);
            self.queue_depth.fetch_add(1, Ordering::Release);
        }
        self.work_ready.notify_one();
        Ok(())
    }
}

/// Cloneable sending side of a pool's queue
///
/// Outlives the pool safely: posting after shutdown fails with `Disposed`.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<PoolInner>,
}

impl Mailbox {
    /// Enqueue a job.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> AccessResult<()> {
        self.inner.push(Box::new(job))
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("queue_depth", &self.inner.queue_depth.load(Ordering::Relaxed))
            .finish()
    }
}

/// A fixed pool of named worker threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Vec<ThreadId>,
}

impl WorkerPool {
    /// Spawn `num_threads` workers.
    ///
    /// A single worker is named `name`; several are named `name-0`, `name-1`, ...
    pub fn new(name: &str, num_threads: usize) -> AccessResult<Self> {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            tasks_completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let thread_name = if num_threads == 1 {
                name.to_string()
            } else {
                format!("{}-{}", name, i)
            };
            let inner_clone = Arc::clone(&inner);
            let spawned = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(&inner_clone));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    let pool = Self::from_parts(inner, workers);
                    pool.shutdown();
                    return Err(AccessError::internal(format!(
                        "failed to spawn worker thread: {}",
                        e
                    )));
                }
            }
        }

        Ok(Self::from_parts(inner, workers))
    }

    fn from_parts(inner: Arc<PoolInner>, workers: Vec<JoinHandle<()>>) -> Self {
        let thread_ids = workers.iter().map(|h| h.thread().id()).collect();
        Self {
            inner,
            workers: Mutex::new(workers),
            thread_ids,
        }
    }

    /// Submit a job.
    ///
    /// Returns `Err(Disposed)` once the pool has been shut down.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> AccessResult<()> {
        self.inner.push(Box::new(work))
    }

    /// A cloneable handle for posting jobs.
    pub fn mailbox(&self) -> Mailbox {
        Mailbox {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Ids of the worker threads.
    pub fn thread_ids(&self) -> &[ThreadId] {
        &self.thread_ids
    }

    /// True when called from one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        self.thread_ids.contains(&std::thread::current().id())
    }

    /// Block until all queued and in-flight jobs have completed.
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(Ordering::Acquire) > 0
            || self.inner.active_tasks.load(Ordering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Signal workers to exit and join them.
    ///
    /// Workers finish the queued jobs first. A worker calling this does not
    /// join itself.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        // Notify under the queue lock so a worker between its shutdown check
        // and its wait cannot miss the wake-up.
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }

        let me = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
    }

    /// Snapshot of pool metrics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            active_tasks: self.inner.active_tasks.load(Ordering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(Ordering::Relaxed),
            worker_count: self.thread_ids.len(),
        }
    }
}

/// Decrements `active_tasks` and notifies drain waiters on drop, panic or not.
struct ActiveTaskGuard<'a> {
    inner: &'a PoolInner,
}

impl Drop for ActiveTaskGuard<'_> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, Ordering::Release);
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);

        if prev_active == 1 && self.inner.queue_depth.load(Ordering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    inner.queue_depth.fetch_sub(1, Ordering::Release);
                    inner.active_tasks.fetch_add(1, Ordering::Release);
                    break job;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveTaskGuard { inner };

        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            error!(
                target: "custodian::db",
                "worker job panicked: {}",
                panic_message(e.as_ref())
            );
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "(non-string panic)".to_string()
    }
}
