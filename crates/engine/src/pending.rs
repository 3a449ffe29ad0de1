//! In-flight asynchronous operation counter
//!
//! Dispose waits on this (bounded) before tearing anything down. The count
//! restarts from zero after each idle period; `end` never underflows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Counter of asynchronous operations in flight
#[derive(Debug, Default)]
pub struct PendingOperations {
    count: Mutex<usize>,
    idle: Condvar,
}

impl PendingOperations {
    /// Create an idle counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of an operation.
    pub fn begin(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            trace!(target: "custodian::db", "pending operations resumed from idle");
        }
        *count += 1;
    }

    /// Record the end of an operation.
    pub fn end(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Begin an operation that ends when the returned guard drops.
    pub fn track(self: &Arc<Self>) -> PendingGuard {
        self.begin();
        PendingGuard {
            pending: Arc::clone(self),
        }
    }

    /// Operations currently in flight.
    pub fn in_flight(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until no operation is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Ends one pending operation exactly once, on drop
#[must_use]
pub struct PendingGuard {
    pending: Arc<PendingOperations>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.end();
    }
}
