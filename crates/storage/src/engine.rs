//! File-backed store engine
//!
//! [`FileEngine`] implements the store engine interface over the single-file
//! format in [`crate::format`]. Handles on the same file share one
//! [`SharedFile`]; write transactions stage a private copy of the state and
//! publish it on commit, after the frame is durable.

use std::path::Path;
use std::sync::Arc;

use custodian_core::{
    ChangeNotification, EngineError, EngineResult, LiveQuery, OpenOptions, Query, Record,
    RecordId, ResultSet, SchemaVersion, StoreEngine, StoreHandle, Waker, WriteTransaction,
};
use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use crate::format::{encode_frame, torn_tail, Op};
use crate::shared::{FileWriter, SharedFile};
use crate::state::{diff, StoreState};

/// Store engine over local files
#[derive(Debug, Default, Clone, Copy)]
pub struct FileEngine;

impl FileEngine {
    /// Create the engine
    pub fn new() -> Self {
        FileEngine
    }
}

impl StoreEngine for FileEngine {
    fn open(&self, options: &OpenOptions) -> EngineResult<Box<dyn StoreHandle>> {
        let shared = SharedFile::acquire(options)?;
        Ok(Box::new(FileHandle::new(shared)))
    }

    fn compact(&self, options: &OpenOptions) -> EngineResult<bool> {
        let shared = SharedFile::acquire(options)?;
        let open = shared.open_handles();
        if open > 0 {
            debug!(
                target: "custodian::storage",
                path = %shared.path().display(),
                open_handles = open,
                "Compaction skipped, handles still open"
            );
            return Ok(false);
        }

        let before = std::fs::metadata(shared.path()).map(|m| m.len()).unwrap_or(0);
        shared.rewrite_snapshot()?;
        let after = std::fs::metadata(shared.path()).map(|m| m.len()).unwrap_or(0);

        info!(
            target: "custodian::storage",
            path = %shared.path().display(),
            before_bytes = before,
            after_bytes = after,
            "Compacted store file"
        );
        Ok(true)
    }

    fn repair(&self, options: &OpenOptions) -> EngineResult<bool> {
        let bytes = match std::fs::read(&options.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let Some(torn) = torn_tail(&bytes) else {
            return Ok(false);
        };

        let file = std::fs::OpenOptions::new().write(true).open(&options.path)?;
        file.set_len(torn.valid_end)?;
        file.sync_all()?;
        warn!(
            target: "custodian::storage",
            path = %options.path.display(),
            valid_end = torn.valid_end,
            truncated_bytes = torn.bytes_to_truncate(),
            "Truncated torn tail of store file"
        );
        Ok(true)
    }
}

/// An open handle on a store file
pub struct FileHandle {
    shared: Arc<SharedFile>,
}

impl FileHandle {
    fn new(shared: Arc<SharedFile>) -> Self {
        shared.handle_opened();
        FileHandle { shared }
    }

    fn check_kind(&self, kind: &str) -> EngineResult<()> {
        if self.shared.schema().contains(kind) {
            Ok(())
        } else {
            Err(EngineError::UnknownObjectType(kind.to_string()))
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.shared.handle_closed();
    }
}

impl StoreHandle for FileHandle {
    fn path(&self) -> &Path {
        self.shared.path()
    }

    fn schema_version(&self) -> SchemaVersion {
        self.shared.schema().version
    }

    fn query(&self, query: &Query) -> EngineResult<ResultSet> {
        self.check_kind(query.kind())?;
        Ok(self.shared.state().read().query(query))
    }

    fn get(&self, id: RecordId) -> EngineResult<Option<Record>> {
        Ok(self.shared.state().read().records.get(&id).cloned())
    }

    fn begin_write(&self) -> EngineResult<Box<dyn WriteTransaction + '_>> {
        let writer = self.shared.writer().lock();
        let staged = self.shared.state().read().clone();
        Ok(Box::new(FileTransaction {
            shared: &self.shared,
            writer,
            staged,
            ops: Vec::new(),
        }))
    }

    fn observe(&self, query: Query, waker: Waker) -> EngineResult<Box<dyn LiveQuery>> {
        self.check_kind(query.kind())?;
        let observer_id = self.shared.add_observer(waker);
        Ok(Box::new(FileLiveQuery {
            shared: Arc::clone(&self.shared),
            query,
            observer_id,
            last: None,
        }))
    }
}

/// Write transaction holding the file's single writer
struct FileTransaction<'a> {
    shared: &'a SharedFile,
    writer: MutexGuard<'a, FileWriter>,
    staged: StoreState,
    ops: Vec<Op>,
}

impl FileTransaction<'_> {
    fn stage(&mut self, op: Op) {
        self.staged.apply(op.clone());
        self.ops.push(op);
    }
}

impl WriteTransaction for FileTransaction<'_> {
    fn insert(&mut self, kind: &str, fields: serde_json::Value) -> EngineResult<RecordId> {
        if !self.shared.schema().contains(kind) {
            return Err(EngineError::UnknownObjectType(kind.to_string()));
        }
        let id = self.staged.allocate_id();
        self.stage(Op::Put(Record {
            id,
            kind: kind.to_string(),
            fields,
        }));
        Ok(id)
    }

    fn update(&mut self, id: RecordId, fields: serde_json::Value) -> EngineResult<()> {
        let mut record = self
            .staged
            .records
            .get(&id)
            .cloned()
            .ok_or(EngineError::RecordNotFound(id))?;
        record.fields = fields;
        self.stage(Op::Put(record));
        Ok(())
    }

    fn remove(&mut self, id: RecordId) -> EngineResult<bool> {
        if !self.staged.records.contains_key(&id) {
            return Ok(false);
        }
        self.stage(Op::Remove(id));
        Ok(true)
    }

    fn get(&self, id: RecordId) -> EngineResult<Option<Record>> {
        Ok(self.staged.records.get(&id).cloned())
    }

    fn query(&self, query: &Query) -> EngineResult<ResultSet> {
        Ok(self.staged.query(query))
    }

    fn commit(self: Box<Self>) -> EngineResult<()> {
        let FileTransaction {
            shared,
            mut writer,
            staged,
            ops,
        } = *self;

        if ops.is_empty() {
            return Ok(());
        }

        writer.append(&encode_frame(&ops)?)?;
        *shared.state().write() = staged;

        // Still holding the writer: wake-ups leave in commit order
        shared.wake_observers();
        drop(writer);
        Ok(())
    }
}

/// Live query over a shared file
struct FileLiveQuery {
    shared: Arc<SharedFile>,
    query: Query,
    observer_id: u64,
    last: Option<ResultSet>,
}

impl LiveQuery for FileLiveQuery {
    fn query(&self) -> &Query {
        &self.query
    }

    fn poll(&mut self) -> EngineResult<Option<ChangeNotification>> {
        let current = self.shared.state().read().query(&self.query);
        let notification = match &self.last {
            None => Some(ChangeNotification::initial(current.clone())),
            Some(previous) => {
                let changes = diff(previous, &current);
                if changes.is_empty() {
                    None
                } else {
                    Some(ChangeNotification {
                        results: current.clone(),
                        changes: Some(changes),
                    })
                }
            }
        };
        self.last = Some(current);
        Ok(notification)
    }
}

impl Drop for FileLiveQuery {
    fn drop(&mut self) {
        self.shared.remove_observer(self.observer_id);
    }
}
