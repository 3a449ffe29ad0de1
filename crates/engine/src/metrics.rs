//! Access statistics
//!
//! Counters are observability only. They carry no correctness invariant, so
//! [`AccessCounters`] uses Relaxed ordering: a snapshot may be momentarily
//! behind concurrent updates but never loses one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which handle served a read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Served by the owning handle on the owning thread
    Owner,
    /// Served by a short-lived handle (off-thread synchronous call or async task)
    Async,
}

/// Receiver of access events, injected through the builder
pub trait MetricsSink: Send + Sync {
    /// A store handle was opened (owning or short-lived)
    fn handle_opened(&self);

    /// A read was served
    fn read(&self, affinity: Affinity);

    /// A write was served
    fn write(&self, affinity: Affinity);

    /// A subscription was registered
    fn subscription_added(&self);

    /// A subscription was disposed
    fn subscription_removed(&self);
}

/// Sink that drops every event
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn handle_opened(&self) {}
    fn read(&self, _affinity: Affinity) {}
    fn write(&self, _affinity: Affinity) {}
    fn subscription_added(&self) {}
    fn subscription_removed(&self) {}
}

/// Atomic counters, the default sink
#[derive(Debug, Default)]
pub struct AccessCounters {
    handles_opened: AtomicU64,
    subscriptions_added: AtomicU64,
    subscriptions_removed: AtomicU64,
    reads_owner: AtomicU64,
    reads_async: AtomicU64,
    writes_owner: AtomicU64,
    writes_async: AtomicU64,
}

impl AccessCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> AccessStats {
        let added = self.subscriptions_added.load(Ordering::Relaxed);
        let removed = self.subscriptions_removed.load(Ordering::Relaxed);
        AccessStats {
            handles_opened: self.handles_opened.load(Ordering::Relaxed),
            subscriptions: added.saturating_sub(removed),
            reads_owner: self.reads_owner.load(Ordering::Relaxed),
            reads_async: self.reads_async.load(Ordering::Relaxed),
            writes_owner: self.writes_owner.load(Ordering::Relaxed),
            writes_async: self.writes_async.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for AccessCounters {
    fn handle_opened(&self) {
        self.handles_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn read(&self, affinity: Affinity) {
        match affinity {
            Affinity::Owner => self.reads_owner.fetch_add(1, Ordering::Relaxed),
            Affinity::Async => self.reads_async.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn write(&self, affinity: Affinity) {
        match affinity {
            Affinity::Owner => self.writes_owner.fetch_add(1, Ordering::Relaxed),
            Affinity::Async => self.writes_async.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn subscription_added(&self) {
        self.subscriptions_added.fetch_add(1, Ordering::Relaxed);
    }

    fn subscription_removed(&self) {
        self.subscriptions_removed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time access statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessStats {
    /// Store handles opened since creation
    pub handles_opened: u64,
    /// Subscriptions currently registered
    pub subscriptions: u64,
    /// Reads served by the owning handle
    pub reads_owner: u64,
    /// Reads served by short-lived handles
    pub reads_async: u64,
    /// Writes served by the owning handle
    pub writes_owner: u64,
    /// Writes served by short-lived handles
    pub writes_async: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_affinity() {
        let counters = AccessCounters::new();
        counters.read(Affinity::Owner);
        counters.read(Affinity::Async);
        counters.read(Affinity::Async);
        counters.write(Affinity::Owner);
        counters.handle_opened();

        let stats = counters.stats();
        assert_eq!(stats.reads_owner, 1);
        assert_eq!(stats.reads_async, 2);
        assert_eq!(stats.writes_owner, 1);
        assert_eq!(stats.writes_async, 0);
        assert_eq!(stats.handles_opened, 1);
    }

    #[test]
    fn test_subscription_gauge() {
        let counters = AccessCounters::new();
        counters.subscription_added();
        counters.subscription_added();
        counters.subscription_removed();
        assert_eq!(counters.stats().subscriptions, 1);
    }
}
