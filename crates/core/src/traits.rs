//! Store engine abstraction
//!
//! These traits describe the embedded object store the access layer sits in
//! front of. The access layer never touches the file format directly; it
//! opens handles, runs transactions, observes live queries and asks for
//! compaction through this interface only.
//!
//! Thread model: an engine is shared by every thread (`Send + Sync`). A handle
//! is used by one thread at a time (`Send`, not `Sync`); the access layer keeps
//! the owning handle pinned to the owning thread and opens a fresh handle for
//! every off-thread operation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::types::{ChangeNotification, Query, Record, RecordId, ResultSet, Schema, SchemaVersion};

/// Wake-up hook called by the engine after a commit that may affect a live query
///
/// Called on the committing thread. Implementations must not block.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Migration entry point invoked by the engine when a file is older than the
/// target schema
///
/// Receives the migration context and the version recorded in the file. The
/// context's [`MigrationContext::new_version`] is the target.
pub type MigrationCallback =
    Arc<dyn Fn(&mut dyn MigrationContext, SchemaVersion) -> Result<(), EngineError> + Send + Sync>;

/// Everything needed to open a store file
#[derive(Clone)]
pub struct OpenOptions {
    /// Path of the store file
    pub path: PathBuf,
    /// Target schema
    pub schema: Schema,
    /// Migration callback for files at an older schema version
    pub migration: Option<MigrationCallback>,
}

impl OpenOptions {
    /// Options for `path` at `schema`, without migration
    pub fn new(path: impl Into<PathBuf>, schema: Schema) -> Self {
        Self {
            path: path.into(),
            schema,
            migration: None,
        }
    }

    /// Same options pointed at another file
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema: self.schema.clone(),
            migration: self.migration.clone(),
        }
    }

    /// Attach a migration callback
    pub fn with_migration(mut self, migration: MigrationCallback) -> Self {
        self.migration = Some(migration);
        self
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("path", &self.path)
            .field("schema", &self.schema)
            .field("migration", &self.migration.is_some())
            .finish()
    }
}

/// An embedded, transactional, schema-versioned object store
pub trait StoreEngine: Send + Sync {
    /// Open a handle on the file described by `options`
    ///
    /// Creates the file when missing. Fails with [`EngineError::SchemaTooNew`]
    /// when the file was written at a higher schema version, and with
    /// [`EngineError::Corrupt`] / [`EngineError::Truncated`] when it cannot be
    /// decoded.
    fn open(&self, options: &OpenOptions) -> EngineResult<Box<dyn StoreHandle>>;

    /// Rewrite the file in its most compact form
    ///
    /// Returns `Ok(false)` when the file cannot be compacted right now (for
    /// example because handles on it are still open).
    fn compact(&self, options: &OpenOptions) -> EngineResult<bool>;

    /// Cut an incomplete final write off the file so the committed prefix
    /// opens again
    ///
    /// Returns `Ok(true)` if the file was shortened, `Ok(false)` if there was
    /// nothing this engine knows how to repair.
    fn repair(&self, options: &OpenOptions) -> EngineResult<bool>;
}

/// An open session on a store file
///
/// Dropping the handle closes it.
pub trait StoreHandle: Send {
    /// Path of the underlying file
    fn path(&self) -> &Path;

    /// Schema version the handle was opened at
    fn schema_version(&self) -> SchemaVersion;

    /// Run an ad-hoc query against the latest committed state
    fn query(&self, query: &Query) -> EngineResult<ResultSet>;

    /// Look up a record by id
    fn get(&self, id: RecordId) -> EngineResult<Option<Record>>;

    /// Start a write transaction
    ///
    /// Blocks while another writer on the same file is active.
    fn begin_write(&self) -> EngineResult<Box<dyn WriteTransaction + '_>>;

    /// Register a live query; `waker` is called after every commit
    fn observe(&self, query: Query, waker: Waker) -> EngineResult<Box<dyn LiveQuery>>;
}

/// A write transaction
///
/// Changes become visible on [`commit`](WriteTransaction::commit). Dropping an
/// uncommitted transaction rolls it back.
pub trait WriteTransaction {
    /// Insert a record, returning its new id
    fn insert(&mut self, kind: &str, fields: serde_json::Value) -> EngineResult<RecordId>;

    /// Replace the fields of an existing record
    fn update(&mut self, id: RecordId, fields: serde_json::Value) -> EngineResult<()>;

    /// Remove a record; returns false if it did not exist
    fn remove(&mut self, id: RecordId) -> EngineResult<bool>;

    /// Look up a record, including uncommitted changes
    fn get(&self, id: RecordId) -> EngineResult<Option<Record>>;

    /// Query, including uncommitted changes
    fn query(&self, query: &Query) -> EngineResult<ResultSet>;

    /// Make the changes durable and visible
    fn commit(self: Box<Self>) -> EngineResult<()>;
}

/// A standing query with incremental change reporting
///
/// Dropping it unregisters the waker.
pub trait LiveQuery: Send {
    /// The observed query
    fn query(&self) -> &Query;

    /// Compute the next delivery
    ///
    /// The first poll returns the initial population (`changes == None`).
    /// Later polls return the diff against the previous delivery, or `None`
    /// when the result set did not change.
    fn poll(&mut self) -> EngineResult<Option<ChangeNotification>>;
}

/// Data access during a schema migration
pub trait MigrationContext {
    /// Version the file was at before this migration
    fn old_version(&self) -> SchemaVersion;

    /// Version being migrated to
    fn new_version(&self) -> SchemaVersion;

    /// All records of `kind`, ordered by id
    fn records(&self, kind: &str) -> Vec<Record>;

    /// Insert a record
    fn insert(&mut self, kind: &str, fields: serde_json::Value) -> EngineResult<RecordId>;

    /// Replace a record's fields
    fn update(&mut self, id: RecordId, fields: serde_json::Value) -> EngineResult<()>;

    /// Remove a record; returns false if it did not exist
    fn remove(&mut self, id: RecordId) -> EngineResult<bool>;

    /// Retag every record of `from` as `to`; returns the number of records moved
    fn rename_kind(&mut self, from: &str, to: &str) -> usize;
}
