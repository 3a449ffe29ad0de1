//! Core types and traits for custodian
//!
//! This crate defines the vocabulary shared by the store engine and the
//! access-coordination layer:
//! - RecordId, SchemaVersion: identifiers
//! - Schema, ObjectType: registered object types at a version
//! - Record, Query, ResultSet: stored data and queries over it
//! - ChangeSet, ChangeNotification: live query deliveries
//! - Traits: StoreEngine, StoreHandle, WriteTransaction, LiveQuery, MigrationContext
//! - Errors: EngineError (store), AccessError (access layer)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AccessError, AccessResult, EngineError, EngineResult};
pub use traits::{
    LiveQuery, MigrationCallback, MigrationContext, OpenOptions, StoreEngine, StoreHandle, Waker,
    WriteTransaction,
};
pub use types::{
    ChangeNotification, ChangeSet, ObjectType, Query, Record, RecordId, ResultSet, Schema,
    SchemaVersion,
};
