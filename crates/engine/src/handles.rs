//! Store handle acquisition
//!
//! Every handle the layer opens, owning or short-lived, goes through
//! [`open_engine_handle`]: disposed check, opening gate, metrics, then the
//! engine.

use std::ops::Deref;

use custodian_core::{
    AccessError, AccessResult, EngineResult, OpenOptions, StoreEngine, StoreHandle,
};

use crate::access::{AccessInner, StoreAccess};
use crate::gate::HandlePermit;
use crate::metrics::MetricsSink;

/// A short-lived handle, closed on drop
///
/// Usable from any thread. Closing it also returns its slot to the
/// short-lived handle bound, when one is configured.
pub struct ShortLivedHandle {
    // Declared first: the handle closes before the permit is returned
    handle: Box<dyn StoreHandle>,
    _permit: Option<HandlePermit>,
}

impl ShortLivedHandle {
    /// The underlying store handle.
    pub fn handle(&self) -> &dyn StoreHandle {
        &*self.handle
    }
}

impl Deref for ShortLivedHandle {
    type Target = dyn StoreHandle;

    fn deref(&self) -> &Self::Target {
        &*self.handle
    }
}

/// Open a handle through the gate.
pub(crate) fn open_engine_handle(
    inner: &AccessInner,
    options: &OpenOptions,
) -> AccessResult<Box<dyn StoreHandle>> {
    if inner.is_disposed() {
        return Err(AccessError::Disposed);
    }
    let _entry = inner.gate.enter()?;
    inner.metrics.handle_opened();
    Ok(inner.engine.open(options)?)
}

/// Opens handles during startup, before the gate is in use
pub(crate) struct HandleOpener<'a> {
    pub(crate) engine: &'a dyn StoreEngine,
    pub(crate) metrics: &'a dyn MetricsSink,
}

impl HandleOpener<'_> {
    pub(crate) fn open(&self, options: &OpenOptions) -> EngineResult<Box<dyn StoreHandle>> {
        self.metrics.handle_opened();
        self.engine.open(options)
    }
}

impl StoreAccess {
    /// Open a fresh handle on the primary file.
    ///
    /// Callable from any thread. Waits while a blocking operation holds the
    /// opening gate, and while the short-lived handle bound is exhausted.
    ///
    /// # Errors
    ///
    /// [`AccessError::Disposed`] after dispose; engine failures as
    /// [`AccessError::Transaction`].
    pub fn open_short_lived(&self) -> AccessResult<ShortLivedHandle> {
        let inner = self.inner();
        let permit = inner.limiter.as_ref().map(|limiter| limiter.acquire());
        let handle = open_engine_handle(inner, &inner.options)?;
        Ok(ShortLivedHandle {
            handle,
            _permit: permit,
        })
    }
}
