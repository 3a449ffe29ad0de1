//! Store access coordinator
//!
//! [`StoreAccess`] is the entry point of the layer. It owns the owning thread,
//! the worker pool, the opening gate and the file lifecycle, and hands out
//! handles according to the calling thread:
//!
//! - on the owning thread, the single long-lived owning handle
//! - anywhere else, a short-lived handle per call
//!
//! Construct it with [`AccessBuilder`]; the first open of the primary file
//! (with recovery and fresh-start fallbacks) happens inside `open`.

use std::fs;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use custodian_core::{
    AccessError, AccessResult, EngineResult, MigrationContext, OpenOptions, Schema, SchemaVersion,
    StoreEngine, StoreHandle, WriteTransaction,
};
use custodian_storage::FileEngine;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::AccessConfig;
use crate::dispatch::run_in_transaction;
use crate::files::{prepare_first_access, StoreFiles};
use crate::gate::{HandleLimiter, OpeningGate};
use crate::handles::{open_engine_handle, HandleOpener};
use crate::maintenance::MaintenanceState;
use crate::metrics::{AccessCounters, AccessStats, MetricsSink};
use crate::migration::MigrationRegistry;
use crate::owner::{install_owner_state, owner_state, take_owner_state, OwnerExecutor, OwnerState};
use crate::pending::PendingOperations;
use crate::pool::WorkerPool;
use crate::subscriptions::{self, register_pending};

/// Application write run once after the first open
pub type StartupCleanup = Box<dyn FnOnce(&mut dyn WriteTransaction) -> AccessResult<()> + Send>;

/// Shared state behind every [`StoreAccess`] clone
pub(crate) struct AccessInner {
    pub(crate) config: AccessConfig,
    pub(crate) files: StoreFiles,
    pub(crate) options: OpenOptions,
    pub(crate) engine: Arc<dyn StoreEngine>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    counters: Option<Arc<AccessCounters>>,
    pub(crate) gate: Arc<OpeningGate>,
    pub(crate) limiter: Option<Arc<HandleLimiter>>,
    pub(crate) owner: OwnerExecutor,
    pub(crate) workers: WorkerPool,
    pub(crate) pending: Arc<PendingOperations>,
    pub(crate) maintenance: Mutex<MaintenanceState>,
    disposed: AtomicBool,
    next_subscription: AtomicU64,
}

impl AccessInner {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn next_subscription_id(&self) -> u64 {
        self.next_subscription.fetch_add(1, Ordering::Relaxed)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(target: "custodian::db", path = %self.options.path.display(), "Disposing store access");

        if !self.pending.wait_idle(self.config.drain_timeout()) {
            error!(
                target: "custodian::db",
                in_flight = self.pending.in_flight(),
                "Store access took too long waiting on pending async operations"
            );
        }

        let teardown = || {
            if let Some(state) = take_owner_state() {
                subscriptions::clear(&state);
                state.close_handle();
            }
        };
        if self.owner.is_current() {
            teardown();
        } else if let Err(e) = self.owner.send(teardown) {
            warn!(target: "custodian::db", error = %e, "Owning thread teardown failed");
        }

        self.gate.close();
        self.workers.shutdown();
        self.owner.shutdown();
    }
}

impl Drop for AccessInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Thread-aware access to one store file
///
/// Cheap to clone; all clones share the same owning thread and state.
/// Closures registered through the layer (subscription callbacks, custom
/// registrations) that capture a clone keep it alive until [`dispose`] is
/// called.
///
/// [`dispose`]: StoreAccess::dispose
#[derive(Clone)]
pub struct StoreAccess {
    inner: Arc<AccessInner>,
}

impl StoreAccess {
    /// Builder for a store in `config.directory`.
    pub fn builder(config: AccessConfig) -> AccessBuilder {
        AccessBuilder::new(config)
    }

    pub(crate) fn inner(&self) -> &AccessInner {
        &self.inner
    }

    /// Configuration in effect.
    pub fn config(&self) -> &AccessConfig {
        &self.inner.config
    }

    /// Store file names and locations.
    pub fn files(&self) -> &StoreFiles {
        &self.inner.files
    }

    /// Schema version the store is opened at.
    pub fn schema_version(&self) -> SchemaVersion {
        self.inner.options.schema.version
    }

    /// Statistics, when the default counters are the metrics sink.
    pub fn stats(&self) -> Option<AccessStats> {
        self.inner.counters.as_ref().map(|c| c.stats())
    }

    /// Asynchronous operations currently in flight.
    pub fn pending_operations(&self) -> usize {
        self.inner.pending.in_flight()
    }

    /// True when called on the owning thread.
    pub fn is_owning_thread(&self) -> bool {
        self.inner.owner.is_current()
    }

    /// True once [`dispose`](Self::dispose) has started.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub(crate) fn ensure_not_disposed(&self) -> AccessResult<()> {
        if self.inner.is_disposed() {
            return Err(AccessError::Disposed);
        }
        Ok(())
    }

    /// Run `f` on the owning thread and return its result.
    ///
    /// Runs inline when already on the owning thread.
    pub fn run_on_owner<T, F>(&self, f: F) -> AccessResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&StoreAccess) -> AccessResult<T> + Send + 'static,
    {
        if self.is_owning_thread() {
            return f(self);
        }
        let access = self.clone();
        self.inner.owner.send(move || f(&access))?
    }

    /// Queue `f` on the owning thread without waiting.
    pub fn post_to_owner<F>(&self, f: F) -> AccessResult<()>
    where
        F: FnOnce(&StoreAccess) + Send + 'static,
    {
        self.ensure_not_disposed()?;
        let access = self.clone();
        self.inner.owner.post(move || f(&access))
    }

    /// The owning handle, opened on first use.
    ///
    /// The handle must not be kept across a blocking operation; it is closed
    /// when one starts.
    ///
    /// # Errors
    ///
    /// [`AccessError::WrongThread`] off the owning thread,
    /// [`AccessError::Reentrancy`] from a reset notification,
    /// [`AccessError::OperationsBlocked`] inside a blocking window.
    pub fn owning_handle(&self) -> AccessResult<Rc<dyn StoreHandle>> {
        if !self.is_owning_thread() {
            return Err(AccessError::WrongThread {
                operation: "owning_handle",
            });
        }
        let state = owner_state().ok_or(AccessError::Disposed)?;
        if state.sending_resets.get() {
            return Err(AccessError::Reentrancy);
        }
        if let Some(reason) = state.blocked.borrow().clone() {
            return Err(AccessError::OperationsBlocked(reason));
        }
        self.ensure_owning_handle(&state)
    }

    /// Open the owning handle if needed, registering subscriptions on a fresh one.
    pub(crate) fn ensure_owning_handle(&self, state: &OwnerState) -> AccessResult<Rc<dyn StoreHandle>> {
        if let Some(handle) = state.handle.borrow().as_ref() {
            return Ok(Rc::clone(handle));
        }

        let handle: Rc<dyn StoreHandle> = Rc::from(open_engine_handle(&self.inner, &self.inner.options)?);
        *state.handle.borrow_mut() = Some(Rc::clone(&handle));
        state.has_initialised_once.set(true);
        info!(
            target: "custodian::db",
            path = %handle.path().display(),
            version = %handle.schema_version(),
            "Opened owning store handle"
        );

        register_pending(self, state);
        Ok(handle)
    }

    /// Shut the layer down.
    ///
    /// Waits (bounded) for in-flight asynchronous operations, tears down every
    /// subscription and the owning handle, then stops the owning thread and
    /// the workers. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl std::fmt::Debug for StoreAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreAccess")
            .field("path", &self.inner.options.path)
            .field("schema", &self.inner.options.schema.version)
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

/// Builder for [`StoreAccess`]
pub struct AccessBuilder {
    config: AccessConfig,
    schema: Schema,
    migrations: MigrationRegistry,
    metrics: Option<Arc<dyn MetricsSink>>,
    engine: Option<Arc<dyn StoreEngine>>,
    startup_cleanup: Option<StartupCleanup>,
}

impl AccessBuilder {
    /// Builder with an empty schema at version 0 and the file engine.
    pub fn new(config: AccessConfig) -> Self {
        Self {
            config,
            schema: Schema::new(0, std::iter::empty::<String>()),
            migrations: MigrationRegistry::new(),
            metrics: None,
            engine: None,
            startup_cleanup: None,
        }
    }

    /// Target schema.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Register the migration step to `version`.
    pub fn migration<F>(mut self, version: u64, step: F) -> Self
    where
        F: Fn(&mut dyn MigrationContext, SchemaVersion) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.migrations.register(version, step);
        self
    }

    /// Replace all migration steps.
    pub fn migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.migrations = migrations;
        self
    }

    /// Metrics sink; defaults to [`AccessCounters`].
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Store engine; defaults to [`FileEngine`].
    pub fn engine(mut self, engine: Arc<dyn StoreEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Write run once after the first open (e.g. purging soft-deleted records).
    ///
    /// Failures are logged, not returned.
    pub fn startup_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce(&mut dyn WriteTransaction) -> AccessResult<()> + Send + 'static,
    {
        self.startup_cleanup = Some(Box::new(cleanup));
        self
    }

    /// Start the owning thread and workers and open the store.
    ///
    /// A primary file from a newer schema or one that cannot be read is
    /// backed up and replaced by a fresh store; see [`crate::files`].
    ///
    /// # Errors
    ///
    /// Configuration errors, I/O and lock failures on the primary file.
    pub fn open(self) -> AccessResult<StoreAccess> {
        let config = self.config;
        config.validate()?;
        fs::create_dir_all(&config.directory)?;

        let mut files = StoreFiles::new(&config.directory, &config.store_filename());
        if config.versioned_filename {
            files.apply_versioned_filename(self.schema.version)?;
        }

        let mut options = OpenOptions::new(files.primary_path(), self.schema);
        if !self.migrations.is_empty() {
            options = options.with_migration(self.migrations.into_callback());
        }

        let (metrics, counters): (Arc<dyn MetricsSink>, _) = match self.metrics {
            Some(metrics) => (metrics, None),
            None => {
                let counters = Arc::new(AccessCounters::new());
                (counters.clone() as Arc<dyn MetricsSink>, Some(counters))
            }
        };
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(FileEngine::new()) as Arc<dyn StoreEngine>);

        let owner = OwnerExecutor::spawn(&config.owner_thread_name)?;
        let workers = WorkerPool::new(&format!("{}-async", config.owner_thread_name), config.async_workers)?;

        let inner = Arc::new(AccessInner {
            limiter: config
                .max_short_lived_handles
                .map(|capacity| Arc::new(HandleLimiter::new(capacity))),
            config,
            files,
            options,
            engine,
            metrics,
            counters,
            gate: Arc::new(OpeningGate::new()),
            owner,
            workers,
            pending: Arc::new(PendingOperations::new()),
            maintenance: Mutex::new(MaintenanceState::Idle),
            disposed: AtomicBool::new(false),
            next_subscription: AtomicU64::new(1),
        });
        let access = StoreAccess { inner };

        let first = access.clone();
        let cleanup = self.startup_cleanup;
        access.inner.owner.send(move || first.initialise(cleanup))??;
        Ok(access)
    }
}

impl StoreAccess {
    /// First access on the owning thread.
    fn initialise(&self, cleanup: Option<StartupCleanup>) -> AccessResult<()> {
        let inner = &self.inner;
        install_owner_state(OwnerState::new(inner.owner.mailbox(), Arc::clone(&inner.metrics)));

        let opener = HandleOpener {
            engine: &*inner.engine,
            metrics: &*inner.metrics,
        };
        let handle = prepare_first_access(&opener, &inner.options, &inner.files)?;
        info!(
            target: "custodian::db",
            path = %handle.path().display(),
            version = %handle.schema_version(),
            "Store ready"
        );

        if let Some(cleanup) = cleanup {
            if let Err(e) = run_in_transaction(&*handle, cleanup) {
                error!(target: "custodian::db", error = %e, "Failed to clean up pending deletions");
            }
        }
        Ok(())
    }
}
