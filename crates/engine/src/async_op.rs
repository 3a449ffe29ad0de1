//! Handles on asynchronous reads and writes
//!
//! An [`AsyncOperation`] is a future (await it from any executor) that can
//! also be waited on synchronously from a plain thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use custodian_core::{AccessError, AccessResult};
use tokio::sync::oneshot;

/// Cooperative cancellation flag
///
/// Cancelling only prevents an operation that has not started yet; a running
/// operation completes normally.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

fn dropped() -> AccessError {
    AccessError::internal("asynchronous operation was dropped before completing")
}

/// A pending asynchronous read or write
#[must_use = "an AsyncOperation does nothing observable unless awaited or waited on"]
pub struct AsyncOperation<T> {
    receiver: oneshot::Receiver<AccessResult<T>>,
    token: CancellationToken,
}

impl<T> AsyncOperation<T> {
    /// Cancel the operation if it has not started yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The operation's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Block the calling thread until the operation completes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous runtime; `.await` it there.
    pub fn wait(self) -> AccessResult<T> {
        self.receiver.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }
}

impl<T> Future for AsyncOperation<T> {
    type Output = AccessResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped())))
    }
}

/// Completing side of an [`AsyncOperation`]
pub(crate) struct AsyncCompleter<T> {
    sender: oneshot::Sender<AccessResult<T>>,
}

impl<T> AsyncCompleter<T> {
    pub(crate) fn complete(self, result: AccessResult<T>) {
        // Receiver gone means nobody is interested in the result
        let _ = self.sender.send(result);
    }
}

pub(crate) fn channel<T>(token: CancellationToken) -> (AsyncCompleter<T>, AsyncOperation<T>) {
    let (sender, receiver) = oneshot::channel();
    (AsyncCompleter { sender }, AsyncOperation { receiver, token })
}
