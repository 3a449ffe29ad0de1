//! Error types for custodian
//!
//! Two layers, two enums:
//! - [`EngineError`] is reported by a store engine (open, query, commit, compact).
//! - [`AccessError`] is reported by the access-coordination layer. Engine errors
//!   reach callers unmodified inside [`AccessError::Transaction`].
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::{RecordId, SchemaVersion};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Result type alias for access-layer operations
pub type AccessResult<T> = std::result::Result<T, AccessError>;

/// Errors reported by a store engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The file was written by a newer schema than this binary understands
    #[error("Provided schema version {target} is less than last set version {file}")]
    SchemaTooNew {
        /// Schema version recorded in the file
        file: SchemaVersion,
        /// Schema version this binary opened with
        target: SchemaVersion,
    },

    /// The file is unreadable (bad magic, checksum mismatch, undecodable frame)
    #[error("Store file is corrupt: {0}")]
    Corrupt(String),

    /// The file ends in the middle of a header or frame
    #[error("Store file is truncated: {0}")]
    Truncated(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record was written with an object type absent from the schema
    #[error("Object type '{0}' is not part of the schema")]
    UnknownObjectType(String),

    /// Update of a record that does not exist
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    /// Another process holds the store file
    #[error("Store file '{}' is locked by another process", .0.display())]
    Locked(PathBuf),

    /// Invalid operation or state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A migration handler failed
    #[error("Migration failed: {0}")]
    Migration(String),
}

impl EngineError {
    /// True when the file was produced by a newer schema version.
    pub fn is_schema_too_new(&self) -> bool {
        matches!(self, EngineError::SchemaTooNew { .. })
    }

    /// True for failures that a fresh start (after backup) can recover from.
    pub fn is_recoverable_corruption(&self) -> bool {
        matches!(self, EngineError::Corrupt(_) | EngineError::Truncated(_))
    }
}

/// Errors reported by the access-coordination layer
#[derive(Debug, Error)]
pub enum AccessError {
    /// Operation invoked from a thread not permitted for that call
    #[error("{operation} must be called from the owning thread")]
    WrongThread {
        /// Name of the rejected operation
        operation: &'static str,
    },

    /// Owning handle requested while reset notifications are being dispatched
    #[error("Cannot retrieve the owning handle from a notification callback during a blocking operation")]
    Reentrancy,

    /// Owning handle requested on the owning thread inside a blocking window
    #[error("All operations are blocked for {0}")]
    OperationsBlocked(String),

    /// Error propagated unmodified from the store engine
    #[error("Store transaction failed: {0}")]
    Transaction(#[from] EngineError),

    /// Compaction kept failing past its wall-clock budget
    #[error("Compaction failed after {attempts} attempts over {elapsed:?}")]
    MaintenanceTimeout {
        /// Compaction attempts made
        attempts: u32,
        /// Time spent retrying
        elapsed: Duration,
    },

    /// Re-establishing the owning handle after a blocking window took too long
    #[error("Re-establishing the owning handle after a block took longer than {0:?}")]
    RestoreTimeout(Duration),

    /// Store file was created by a newer binary
    #[error("Store file schema {file} is newer than supported schema {target}")]
    SchemaTooNew {
        /// Schema version recorded in the file
        file: SchemaVersion,
        /// Schema version of this binary
        target: SchemaVersion,
    },

    /// Store file unreadable after the repair attempt
    #[error("Store file is corrupt: {0}")]
    Corruption(String),

    /// The layer has been disposed
    #[error("Store access has been disposed")]
    Disposed,

    /// An asynchronous operation was cancelled before it started
    #[error("Operation cancelled")]
    Cancelled,

    /// `create_backup` was called without holding a blocking window
    #[error("Call block_all_operations before creating a backup")]
    BackupRequiresBlock,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error outside the engine (backups, recovery file handling)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant failure (panicked task, dropped channel)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AccessError {
    /// Classify a failed open of the primary file.
    ///
    /// Schema and corruption failures become their dedicated variants; anything
    /// else stays a store error.
    pub fn from_open_failure(err: EngineError) -> Self {
        match err {
            EngineError::SchemaTooNew { file, target } => AccessError::SchemaTooNew { file, target },
            EngineError::Corrupt(msg) | EngineError::Truncated(msg) => AccessError::Corruption(msg),
            other => AccessError::Transaction(other),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        AccessError::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        AccessError::Config(msg.into())
    }

    /// True for thread-affinity and reentrancy violations (programming errors)
    pub fn is_programming_error(&self) -> bool {
        matches!(self, AccessError::WrongThread { .. } | AccessError::Reentrancy)
    }

    /// The engine error behind this error, if any
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            AccessError::Transaction(e) => Some(e),
            _ => None,
        }
    }
}
