//! Opening gate and short-lived handle limiter
//!
//! The gate serializes opening new store handles and is held for the whole
//! of a blocking maintenance window. Already-open handles keep working while
//! it is held; only new opens wait.
//!
//! The gate records its holder thread. A thread that already holds the gate
//! passes straight through [`OpeningGate::enter`], so the maintenance
//! coordinator can open handles while it holds the gate without deadlocking
//! on itself.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use custodian_core::{AccessError, AccessResult};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    holder: Option<ThreadId>,
    closed: bool,
}

/// Binary gate with holder tracking
#[derive(Debug, Default)]
pub struct OpeningGate {
    state: Mutex<GateState>,
    released: Condvar,
}

impl OpeningGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate for the duration of one handle open.
    ///
    /// Returns immediately (without taking the gate again) if the calling
    /// thread already holds it.
    ///
    /// # Errors
    ///
    /// [`AccessError::Disposed`] once the gate has been closed.
    pub fn enter(&self) -> AccessResult<GateEntry<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.holder == Some(me) && !state.closed {
            return Ok(GateEntry { gate: None });
        }
        self.wait_free(&mut state)?;
        state.holder = Some(me);
        Ok(GateEntry { gate: Some(self) })
    }

    /// Take the gate until the returned hold is released.
    ///
    /// The hold may be released from any thread.
    ///
    /// # Errors
    ///
    /// [`AccessError::Disposed`] once closed, [`AccessError::OperationsBlocked`]
    /// if the calling thread already holds the gate.
    pub fn acquire(self: &Arc<Self>) -> AccessResult<GateHold> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.holder == Some(me) {
            return Err(AccessError::OperationsBlocked(
                "a blocking operation is already in progress on this thread".to_string(),
            ));
        }
        self.wait_free(&mut state)?;
        state.holder = Some(me);
        Ok(GateHold {
            gate: Arc::clone(self),
        })
    }

    fn wait_free(&self, state: &mut parking_lot::MutexGuard<'_, GateState>) -> AccessResult<()> {
        while state.holder.is_some() && !state.closed {
            self.released.wait(state);
        }
        if state.closed {
            return Err(AccessError::Disposed);
        }
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.holder = None;
        self.released.notify_all();
    }

    /// True while any thread holds the gate
    pub fn is_held(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    /// True if the calling thread holds the gate
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().holder == Some(thread::current().id())
    }

    /// Close the gate; every waiter and later caller gets `Disposed`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.released.notify_all();
    }
}

/// Scoped entry for one handle open; a no-op when re-entered
#[must_use]
pub struct GateEntry<'a> {
    gate: Option<&'a OpeningGate>,
}

impl GateEntry<'_> {
    /// True if this entry re-entered a gate the thread already held
    pub fn is_reentrant(&self) -> bool {
        self.gate.is_none()
    }
}

impl Drop for GateEntry<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate {
            gate.release();
        }
    }
}

/// Long-lived hold on the gate, released on drop from any thread
#[must_use]
pub struct GateHold {
    gate: Arc<OpeningGate>,
}

impl Drop for GateHold {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Bound on concurrently open short-lived handles
#[derive(Debug)]
pub struct HandleLimiter {
    available: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

impl HandleLimiter {
    /// Allow at most `capacity` concurrent handles
    pub fn new(capacity: usize) -> Self {
        Self {
            available: Mutex::new(capacity),
            freed: Condvar::new(),
            capacity,
        }
    }

    /// Maximum concurrent handles
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Wait for a free slot
    pub fn acquire(self: &Arc<Self>) -> HandlePermit {
        let mut available = self.available.lock();
        while *available == 0 {
            self.freed.wait(&mut available);
        }
        *available -= 1;
        HandlePermit {
            limiter: Arc::clone(self),
        }
    }
}

/// One slot of a [`HandleLimiter`], returned on drop
pub struct HandlePermit {
    limiter: Arc<HandleLimiter>,
}

impl Drop for HandlePermit {
    fn drop(&mut self) {
        let mut available = self.limiter.available.lock();
        *available += 1;
        self.limiter.freed.notify_one();
    }
}
