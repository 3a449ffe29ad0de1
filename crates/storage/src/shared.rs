//! Per-file shared state and the process-wide file registry
//!
//! Every handle on the same file shares one [`SharedFile`]: the decoded
//! records, the single append writer and the set of live query wakers. The
//! shared state lives as long as any handle or live query references it; the
//! exclusive lock file is held for exactly that long.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use custodian_core::{
    EngineError, EngineResult, MigrationContext, OpenOptions, Record, RecordId, Schema,
    SchemaVersion, Waker,
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::format::{decode_file, encode_frame, FileHeader, Op};
use crate::state::StoreState;

// =============================================================================
// Global File Registry
// =============================================================================
//
// Opening the same file twice in one process shares a single SharedFile, so
// two handles never append through two writers. Weak references let the state
// (and the lock file) go away once the last handle and live query are dropped.

/// Global registry of open store files (canonical path -> weak reference)
pub static OPEN_FILES: Lazy<Mutex<HashMap<PathBuf, Weak<SharedFile>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Append-only writer for a store file
pub(crate) struct FileWriter {
    file: File,
}

impl FileWriter {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new().append(true).open(path)?;
        Ok(FileWriter { file })
    }

    /// Append a frame and sync it to disk.
    pub(crate) fn append(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        self.file.sync_data()
    }
}

/// State shared by every handle on one file
pub struct SharedFile {
    path: PathBuf,
    schema: Schema,
    state: RwLock<StoreState>,
    writer: Mutex<FileWriter>,
    open_handles: AtomicUsize,
    observers: Mutex<FxHashMap<u64, Waker>>,
    next_observer: AtomicU64,
    // Held for the lifetime of the shared state
    _lock_file: File,
}

impl SharedFile {
    /// Get the shared state for `options.path`, loading it if needed.
    pub(crate) fn acquire(options: &OpenOptions) -> EngineResult<Arc<SharedFile>> {
        let path = canonical_file_path(&options.path)?;

        // Hold the registry lock for the whole load so two threads never
        // decode the same file concurrently.
        let mut registry = OPEN_FILES.lock();

        if let Some(existing) = registry.get(&path).and_then(Weak::upgrade) {
            if existing.schema.version != options.schema.version {
                return Err(EngineError::InvalidState(format!(
                    "'{}' is already open at schema {}, requested {}",
                    path.display(),
                    existing.schema.version,
                    options.schema.version
                )));
            }
            return Ok(existing);
        }

        let shared = Arc::new(SharedFile::load(path.clone(), options)?);
        registry.insert(path, Arc::downgrade(&shared));
        Ok(shared)
    }

    fn load(path: PathBuf, options: &OpenOptions) -> EngineResult<SharedFile> {
        let lock_file = lock_store_file(&path)?;
        let target = options.schema.version;

        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            let decoded = decode_file(&bytes, target)?;
            let mut state = StoreState::replay(&decoded.frames);

            if decoded.schema_version < target {
                info!(
                    target: "custodian::storage",
                    path = %path.display(),
                    from = %decoded.schema_version,
                    to = %target,
                    "Migrating store file"
                );
                if let Some(migration) = &options.migration {
                    let mut ctx = MigrationState {
                        old: decoded.schema_version,
                        new: target,
                        schema: &options.schema,
                        state: &mut state,
                    };
                    migration(&mut ctx, decoded.schema_version)?;
                }
                write_snapshot(&path, target, &state)?;
            }

            debug!(
                target: "custodian::storage",
                path = %path.display(),
                frames = decoded.frames.len(),
                records = state.records.len(),
                "Loaded store file"
            );
            state
        } else {
            write_snapshot(&path, target, &StoreState::default())?;
            info!(target: "custodian::storage", path = %path.display(), schema = %target, "Created store file");
            StoreState::default()
        };

        let writer = FileWriter::open(&path)?;

        Ok(SharedFile {
            path,
            schema: options.schema.clone(),
            state: RwLock::new(state),
            writer: Mutex::new(writer),
            open_handles: AtomicUsize::new(0),
            observers: Mutex::new(FxHashMap::default()),
            next_observer: AtomicU64::new(0),
            _lock_file: lock_file,
        })
    }

    /// Canonical path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema the file was opened at
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of open handles on this file
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    pub(crate) fn handle_opened(&self) {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn handle_closed(&self) {
        self.open_handles.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn state(&self) -> &RwLock<StoreState> {
        &self.state
    }

    pub(crate) fn writer(&self) -> &Mutex<FileWriter> {
        &self.writer
    }

    pub(crate) fn add_observer(&self, waker: Waker) -> u64 {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().insert(id, waker);
        id
    }

    pub(crate) fn remove_observer(&self, id: u64) {
        self.observers.lock().remove(&id);
    }

    /// Call every registered waker. Wakers run outside the observer lock.
    pub(crate) fn wake_observers(&self) {
        let wakers: Vec<Waker> = self.observers.lock().values().cloned().collect();
        for waker in wakers {
            waker();
        }
    }

    /// Rewrite the file as a single snapshot frame.
    ///
    /// Holds the writer for the duration so no commit interleaves with the
    /// rewrite, then reopens the writer on the new file.
    pub(crate) fn rewrite_snapshot(&self) -> EngineResult<()> {
        let mut writer = self.writer.lock();
        let state = self.state.read();
        write_snapshot(&self.path, self.schema.version, &state)?;
        *writer = FileWriter::open(&self.path)?;
        Ok(())
    }
}

/// Write `state` as a fresh file at `path` (temp file, then rename).
pub(crate) fn write_snapshot(
    path: &Path,
    schema_version: SchemaVersion,
    state: &StoreState,
) -> EngineResult<()> {
    let tmp_path = sibling_with_suffix(path, "compact");
    let mut bytes = FileHeader::new(schema_version).to_bytes().to_vec();
    bytes.extend(encode_frame(&state.snapshot_ops())?);

    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Acquire the exclusive process lock for a store file.
///
/// The lock file is `{file}.lock` next to the store file and is not deleted
/// when released.
pub(crate) fn lock_store_file(path: &Path) -> EngineResult<File> {
    let lock_path = sibling_with_suffix(path, "lock");
    let lock_file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)?;
    fs2::FileExt::try_lock_exclusive(&lock_file)
        .map_err(|_| EngineError::Locked(path.to_path_buf()))?;
    Ok(lock_file)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Canonical form of a (possibly not yet existing) file path.
///
/// Creates the parent directory so it can be canonicalized.
pub(crate) fn canonical_file_path(path: &Path) -> EngineResult<PathBuf> {
    let file_name = path.file_name().ok_or_else(|| {
        EngineError::InvalidState(format!("'{}' does not name a file", path.display()))
    })?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    Ok(parent.canonicalize()?.join(file_name))
}

/// Migration view over a state being upgraded
struct MigrationState<'a> {
    old: SchemaVersion,
    new: SchemaVersion,
    schema: &'a Schema,
    state: &'a mut StoreState,
}

impl MigrationContext for MigrationState<'_> {
    fn old_version(&self) -> SchemaVersion {
        self.old
    }

    fn new_version(&self) -> SchemaVersion {
        self.new
    }

    fn records(&self, kind: &str) -> Vec<Record> {
        self.state
            .records
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    fn insert(&mut self, kind: &str, fields: serde_json::Value) -> EngineResult<RecordId> {
        if !self.schema.contains(kind) {
            return Err(EngineError::UnknownObjectType(kind.to_string()));
        }
        let id = self.state.allocate_id();
        self.state.apply(Op::Put(Record {
            id,
            kind: kind.to_string(),
            fields,
        }));
        Ok(id)
    }

    fn update(&mut self, id: RecordId, fields: serde_json::Value) -> EngineResult<()> {
        let record = self
            .state
            .records
            .get_mut(&id)
            .ok_or(EngineError::RecordNotFound(id))?;
        record.fields = fields;
        Ok(())
    }

    fn remove(&mut self, id: RecordId) -> EngineResult<bool> {
        Ok(self.state.records.remove(&id).is_some())
    }

    fn rename_kind(&mut self, from: &str, to: &str) -> usize {
        let mut moved = 0;
        for record in self.state.records.values_mut().filter(|r| r.kind == from) {
            record.kind = to.to_string();
            moved += 1;
        }
        moved
    }
}
