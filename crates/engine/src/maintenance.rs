//! Blocking maintenance window
//!
//! `block_all_operations` takes the opening gate, tears down the owning
//! handle and its live registrations, compacts the file (which proves no
//! other handle is open) and sends reset notifications. The returned
//! [`BlockGuard`] re-establishes the owning handle and its subscriptions,
//! then releases the gate.
//!
//! ```text
//! Idle -> Blocking -> Compacting -> NotifyingReset -> RunningCallerWork -> Restoring -> Idle
//! ```
//!
//! A failure at any step goes straight to Restoring.

use std::thread;
use std::time::Instant;

use custodian_core::{AccessError, AccessResult};
use tracing::{debug, error, info, warn};

use crate::access::StoreAccess;
use crate::gate::GateHold;
use crate::owner::{owner_state, OwnerState};
use crate::subscriptions::{register_pending, send_resets, teardown_lives};

/// Phase of the maintenance window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaintenanceState {
    /// No blocking operation in progress
    #[default]
    Idle,
    /// Gate taken, owning handle being torn down
    Blocking,
    /// Retrying compaction
    Compacting,
    /// Dispatching reset notifications
    NotifyingReset,
    /// Caller's work runs inside the window
    RunningCallerWork,
    /// Owning handle being re-established
    Restoring,
}

impl StoreAccess {
    /// Current phase of the maintenance window.
    pub fn maintenance_state(&self) -> MaintenanceState {
        *self.inner().maintenance.lock()
    }

    fn set_maintenance_state(&self, state: MaintenanceState) {
        *self.inner().maintenance.lock() = state;
        debug!(target: "custodian::maintenance", ?state, "maintenance state changed");
    }

    /// Block all store operations until the returned guard is released.
    ///
    /// While blocked, opening any new handle waits, and the owning handle is
    /// unavailable ([`AccessError::OperationsBlocked`]). Subscriptions that
    /// asked for resets receive an empty result set once the file is
    /// isolated.
    ///
    /// # Errors
    ///
    /// [`AccessError::WrongThread`] off the owning thread,
    /// [`AccessError::Disposed`] after dispose, and
    /// [`AccessError::MaintenanceTimeout`] when compaction did not succeed
    /// within the configured budget. On error, operations are restored before
    /// returning.
    pub fn block_all_operations(&self, reason: &str) -> AccessResult<BlockGuard> {
        info!(target: "custodian::maintenance", reason, "Attempting to block all store operations");

        if !self.is_owning_thread() {
            return Err(AccessError::WrongThread {
                operation: "block_all_operations",
            });
        }
        self.ensure_not_disposed()?;
        let state = owner_state().ok_or(AccessError::Disposed)?;

        let hold = self.inner().gate.acquire()?;
        self.set_maintenance_state(MaintenanceState::Blocking);
        *state.blocked.borrow_mut() = Some(reason.to_string());

        let mut guard = BlockGuard {
            access: self.clone(),
            hold: Some(hold),
            restore_handle: state.has_initialised_once.get(),
        };

        match self.isolate(&state, guard.restore_handle) {
            Ok(()) => {
                self.set_maintenance_state(MaintenanceState::RunningCallerWork);
                Ok(guard)
            }
            Err(e) => {
                error!(target: "custodian::maintenance", reason, error = %e, "Blocking operation failed");
                if let Err(restore) = guard.release_inner() {
                    warn!(target: "custodian::maintenance", error = %restore, "Restore after failed block also failed");
                }
                Err(e)
            }
        }
    }

    /// Run `work` inside a blocking window, then restore.
    ///
    /// The first error wins: a failure of `work` is returned even if the
    /// restore also fails.
    pub fn block_all_operations_with<T, F>(&self, reason: &str, work: F) -> AccessResult<T>
    where
        F: FnOnce(&BlockGuard) -> AccessResult<T>,
    {
        let guard = self.block_all_operations(reason)?;
        let result = work(&guard);
        let restored = guard.release();
        let value = result?;
        restored?;
        Ok(value)
    }

    fn isolate(&self, state: &OwnerState, had_handle: bool) -> AccessResult<()> {
        if had_handle {
            teardown_lives(state);
            if state.close_handle() {
                debug!(target: "custodian::maintenance", "Closed owning handle");
            }
        }
        info!(target: "custodian::maintenance", "Lock acquired for blocking operations");

        self.set_maintenance_state(MaintenanceState::Compacting);
        self.compact_with_retry()?;
        info!(target: "custodian::maintenance", "Store usage isolated via compact");

        if had_handle {
            self.set_maintenance_state(MaintenanceState::NotifyingReset);
            send_resets(state);
        }
        Ok(())
    }

    /// Compact the store file.
    ///
    /// Returns `Ok(false)` while any handle on the file is still open.
    pub fn compact(&self) -> AccessResult<bool> {
        let inner = self.inner();
        Ok(inner.engine.compact(&inner.options)?)
    }

    fn compact_with_retry(&self) -> AccessResult<()> {
        let config = &self.inner().config;
        let interval = config.compact_retry_interval();
        let budget = config.compact_budget();
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.compact() {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!(target: "custodian::maintenance", attempts, "Compaction refused, handles still open")
                }
                Err(e) => {
                    warn!(target: "custodian::maintenance", attempts, error = %e, "Compaction failed")
                }
            }

            thread::sleep(interval);
            let elapsed = started.elapsed();
            if elapsed > budget {
                return Err(AccessError::MaintenanceTimeout { attempts, elapsed });
            }
        }
    }

    /// Copy the store file to `backup_filename` next to it.
    ///
    /// # Errors
    ///
    /// [`AccessError::BackupRequiresBlock`] unless a blocking window is held.
    pub fn create_backup(&self, backup_filename: &str) -> AccessResult<()> {
        if !self.inner().gate.is_held() {
            return Err(AccessError::BackupRequiresBlock);
        }
        self.inner().files.create_backup(backup_filename)
    }
}

/// An active blocking window
///
/// Releasing (explicitly or by dropping) restores operations. May be
/// released from any thread. Off the owning thread the restore is bounded by
/// the configured restore timeout. On the owning thread it runs inline and
/// is not bounded: it takes as long as reopening the handle and
/// re-registering subscriptions takes.
#[must_use = "dropping a BlockGuard immediately restores operations"]
pub struct BlockGuard {
    access: StoreAccess,
    hold: Option<GateHold>,
    restore_handle: bool,
}

impl BlockGuard {
    /// The access layer this window blocks.
    pub fn access(&self) -> &StoreAccess {
        &self.access
    }

    /// Restore operations.
    ///
    /// # Errors
    ///
    /// [`AccessError::RestoreTimeout`] when the owning thread did not
    /// re-establish its handle in time; engine errors from reopening. The
    /// gate is released and the state returns to Idle either way.
    pub fn release(mut self) -> AccessResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> AccessResult<()> {
        let Some(hold) = self.hold.take() else {
            return Ok(());
        };
        info!(target: "custodian::maintenance", "Restoring store operations");
        self.access.set_maintenance_state(MaintenanceState::Restoring);

        let restored = self.restore();

        drop(hold);
        self.access.set_maintenance_state(MaintenanceState::Idle);
        restored
    }

    fn restore(&self) -> AccessResult<()> {
        let inner = self.access.inner();
        let access = self.access.clone();
        let restore_handle = self.restore_handle;
        let job = move || restore_on_owner(&access, restore_handle);

        if inner.owner.is_current() {
            return job();
        }
        let timeout = inner.config.restore_timeout();
        match inner.owner.submit(job)?.wait_timeout(timeout) {
            Some(result) => result.and_then(|restored| restored),
            None => Err(AccessError::RestoreTimeout(timeout)),
        }
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            error!(target: "custodian::maintenance", error = %e, "Failed to restore store operations");
        }
    }
}

fn restore_on_owner(access: &StoreAccess, restore_handle: bool) -> AccessResult<()> {
    let state = owner_state().ok_or(AccessError::Disposed)?;
    state.blocked.borrow_mut().take();
    if restore_handle || !state.registry.borrow().is_empty() {
        access.ensure_owning_handle(&state)?;
        register_pending(access, &state);
    }
    Ok(())
}
