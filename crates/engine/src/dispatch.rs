//! Read and write dispatch
//!
//! Synchronous calls on the owning thread use the owning handle. Synchronous
//! calls from any other thread open a short-lived handle for the duration of
//! the call. Asynchronous calls are only accepted on the owning thread; they
//! run on the worker pool, and therefore always on a short-lived handle.

use custodian_core::{AccessError, AccessResult, StoreHandle, WriteTransaction};

use crate::access::StoreAccess;
use crate::async_op::{self, AsyncOperation, CancellationToken};
use crate::metrics::Affinity;

/// Run `f` in a write transaction on `handle`, committing on success.
///
/// The transaction rolls back if `f` fails.
pub fn run_in_transaction<T, F>(handle: &dyn StoreHandle, f: F) -> AccessResult<T>
where
    F: FnOnce(&mut dyn WriteTransaction) -> AccessResult<T>,
{
    let mut txn = handle.begin_write()?;
    let value = f(&mut *txn)?;
    txn.commit()?;
    Ok(value)
}

impl StoreAccess {
    /// Run a read against the store.
    ///
    /// On the owning thread this uses the owning handle; elsewhere a
    /// short-lived handle open for the duration of the call.
    pub fn read<T, F>(&self, f: F) -> AccessResult<T>
    where
        F: FnOnce(&dyn StoreHandle) -> AccessResult<T>,
    {
        if self.is_owning_thread() {
            self.inner().metrics.read(Affinity::Owner);
            let handle = self.owning_handle()?;
            f(&*handle)
        } else {
            self.inner().metrics.read(Affinity::Async);
            let handle = self.open_short_lived()?;
            f(handle.handle())
        }
    }

    /// Run `f` in a write transaction, committing on success.
    ///
    /// Handle selection follows [`read`](Self::read).
    pub fn write<T, F>(&self, f: F) -> AccessResult<T>
    where
        F: FnOnce(&mut dyn WriteTransaction) -> AccessResult<T>,
    {
        if self.is_owning_thread() {
            self.inner().metrics.write(Affinity::Owner);
            let handle = self.owning_handle()?;
            run_in_transaction(&*handle, f)
        } else {
            self.inner().metrics.write(Affinity::Async);
            let handle = self.open_short_lived()?;
            run_in_transaction(handle.handle(), f)
        }
    }

    /// Queue a read on the worker pool.
    ///
    /// # Errors
    ///
    /// [`AccessError::Disposed`] after dispose, [`AccessError::WrongThread`]
    /// off the owning thread.
    pub fn read_async<T, F>(&self, f: F) -> AccessResult<AsyncOperation<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StoreHandle) -> AccessResult<T> + Send + 'static,
    {
        self.read_async_with_cancel(f, CancellationToken::new())
    }

    /// [`read_async`](Self::read_async) with a caller-supplied cancellation token.
    pub fn read_async_with_cancel<T, F>(
        &self,
        f: F,
        token: CancellationToken,
    ) -> AccessResult<AsyncOperation<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StoreHandle) -> AccessResult<T> + Send + 'static,
    {
        self.spawn_async("read_async", token, move |access| access.read(f))
    }

    /// Queue a write on the worker pool.
    ///
    /// # Errors
    ///
    /// As [`read_async`](Self::read_async).
    pub fn write_async<T, F>(&self, f: F) -> AccessResult<AsyncOperation<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn WriteTransaction) -> AccessResult<T> + Send + 'static,
    {
        self.write_async_with_cancel(f, CancellationToken::new())
    }

    /// [`write_async`](Self::write_async) with a caller-supplied cancellation token.
    pub fn write_async_with_cancel<T, F>(
        &self,
        f: F,
        token: CancellationToken,
    ) -> AccessResult<AsyncOperation<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn WriteTransaction) -> AccessResult<T> + Send + 'static,
    {
        self.spawn_async("write_async", token, move |access| access.write(f))
    }

    fn spawn_async<T, F>(
        &self,
        operation: &'static str,
        token: CancellationToken,
        work: F,
    ) -> AccessResult<AsyncOperation<T>>
    where
        T: Send + 'static,
        F: FnOnce(&StoreAccess) -> AccessResult<T> + Send + 'static,
    {
        self.ensure_not_disposed()?;
        if !self.is_owning_thread() {
            return Err(AccessError::WrongThread { operation });
        }

        let guard = self.inner().pending.track();
        let (completer, op) = async_op::channel(token.clone());
        let access = self.clone();
        // On a rejected submit the job is dropped: the guard ends the pending
        // operation and the completer resolves `op` with an internal error.
        self.inner().workers.submit(move || {
            let result = if token.is_cancelled() {
                Err(AccessError::Cancelled)
            } else {
                work(&access)
            };
            completer.complete(result);
            // Pending count drops before the last reference can dispose
            drop(guard);
            drop(access);
        })?;
        Ok(op)
    }
}
