//! The owning thread
//!
//! One dedicated thread owns the long-lived store handle and every live
//! subscription. Work reaches it through a single-worker [`WorkerPool`], so
//! jobs run strictly in posting order. State that must never leave the thread
//! (the handle, the subscription registry, the blocking flags) lives in a
//! thread-local [`OwnerState`] installed when the access layer starts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use custodian_core::{AccessError, AccessResult, StoreHandle};
use parking_lot::{Condvar, Mutex};

use crate::metrics::MetricsSink;
use crate::pool::{panic_message, Mailbox, WorkerPool};
use crate::subscriptions::Registry;

/// Executor for the owning thread
pub struct OwnerExecutor {
    pool: WorkerPool,
    thread_id: ThreadId,
}

impl OwnerExecutor {
    /// Spawn the owning thread under `name`.
    pub fn spawn(name: &str) -> AccessResult<Self> {
        let pool = WorkerPool::new(name, 1)?;
        let thread_id = pool
            .thread_ids()
            .first()
            .copied()
            .ok_or_else(|| AccessError::internal("owning thread did not start"))?;
        Ok(Self { pool, thread_id })
    }

    /// Id of the owning thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// True when called on the owning thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Cloneable posting handle.
    pub fn mailbox(&self) -> Mailbox {
        self.pool.mailbox()
    }

    /// Queue a job without waiting for it.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> AccessResult<()> {
        self.pool.submit(job)
    }

    /// Queue a job and return a handle on its result.
    ///
    /// A panic inside the job is reported as [`AccessError::Internal`].
    pub fn submit<T, F>(&self, f: F) -> AccessResult<Completion<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (completer, completion) = completion();
        self.pool.submit(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(|e| {
                AccessError::internal(format!("owner job panicked: {}", panic_message(e.as_ref())))
            });
            completer.complete(result);
        })?;
        Ok(completion)
    }

    /// Run `f` on the owning thread and wait for its result.
    ///
    /// Runs inline when already on the owning thread.
    pub fn send<T, F>(&self, f: F) -> AccessResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        self.submit(f)?.wait()
    }

    /// Stop the owning thread after it finishes queued jobs.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

struct Slot<T> {
    value: Mutex<Option<AccessResult<T>>>,
    ready: Condvar,
}

fn completion<T>() -> (Completer<T>, Completion<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        Completer {
            slot: Some(Arc::clone(&slot)),
        },
        Completion { slot },
    )
}

/// Result of a job queued on the owning thread
#[must_use]
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completion<T> {
    /// Block until the job has run.
    pub fn wait(self) -> AccessResult<T> {
        let mut value = self.slot.value.lock();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            self.slot.ready.wait(&mut value);
        }
    }

    /// Block for at most `timeout`; `None` if the job has not finished.
    pub fn wait_timeout(self, timeout: Duration) -> Option<AccessResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut value = self.slot.value.lock();
        loop {
            if let Some(result) = value.take() {
                return Some(result);
            }
            if self.slot.ready.wait_until(&mut value, deadline).timed_out() {
                return value.take();
            }
        }
    }
}

/// Writing side of a [`Completion`]
///
/// Dropped without completing (the job was discarded) it reports an
/// internal error so the waiter never hangs.
struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Completer<T> {
    fn complete(mut self, result: AccessResult<T>) {
        if let Some(slot) = self.slot.take() {
            *slot.value.lock() = Some(result);
            slot.ready.notify_all();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            *slot.value.lock() = Some(Err(AccessError::internal(
                "owner job was dropped before it ran",
            )));
            slot.ready.notify_all();
        }
    }
}

/// Owning-thread state, reachable only from the owning thread
pub(crate) struct OwnerState {
    /// Posting handle for delivery jobs
    pub(crate) mailbox: Mailbox,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    /// The long-lived handle, opened lazily
    pub(crate) handle: RefCell<Option<Rc<dyn StoreHandle>>>,
    /// Set the first time the owning handle is opened
    pub(crate) has_initialised_once: Cell<bool>,
    /// Set while reset notifications are being dispatched
    pub(crate) sending_resets: Cell<bool>,
    /// Reason of the current blocking window, if any
    pub(crate) blocked: RefCell<Option<String>>,
    pub(crate) registry: RefCell<Registry>,
}

impl OwnerState {
    pub(crate) fn new(mailbox: Mailbox, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            mailbox,
            metrics,
            handle: RefCell::new(None),
            has_initialised_once: Cell::new(false),
            sending_resets: Cell::new(false),
            blocked: RefCell::new(None),
            registry: RefCell::new(Registry::default()),
        }
    }

    /// Close the owning handle, if open. Returns true if one was open.
    pub(crate) fn close_handle(&self) -> bool {
        self.handle.borrow_mut().take().is_some()
    }
}

thread_local! {
    static OWNER_STATE: RefCell<Option<Rc<OwnerState>>> = const { RefCell::new(None) };
}

/// Install `state` as this thread's owner state.
pub(crate) fn install_owner_state(state: OwnerState) {
    OWNER_STATE.with(|slot| *slot.borrow_mut() = Some(Rc::new(state)));
}

/// This thread's owner state, if installed.
pub(crate) fn owner_state() -> Option<Rc<OwnerState>> {
    OWNER_STATE.with(|slot| slot.borrow().clone())
}

/// Remove and return this thread's owner state.
pub(crate) fn take_owner_state() -> Option<Rc<OwnerState>> {
    OWNER_STATE.with(|slot| slot.borrow_mut().take())
}
