//! Custodian - thread-aware access coordination for an embedded object store
//!
//! Custodian keeps exactly one long-lived store handle on a dedicated owning
//! thread, hands out short-lived handles to every other thread, delivers live
//! query changes on the owning thread, and can pause all store use for a
//! blocking maintenance window (compaction, backups).
//!
//! # Quick Start
//!
//! ```ignore
//! use custodian::{AccessConfig, Query, Schema, StoreAccess};
//! use serde_json::json;
//!
//! let access = StoreAccess::builder(AccessConfig::new("/var/lib/app", "client"))
//!     .schema(Schema::new(1, ["Score"]))
//!     .open()?;
//!
//! access.write(|txn| Ok(txn.insert("Score", json!({ "total": 10 }))?))?;
//! let scores = access.read(|h| Ok(h.query(&Query::all("Score"))?))?;
//! ```
//!
//! # Architecture
//!
//! - `custodian-core`: shared types, errors and the store engine traits
//! - `custodian-storage`: the reference file-backed store engine
//! - `custodian-engine`: the access coordination layer

pub use custodian_core::*;
pub use custodian_engine::*;
pub use custodian_storage::FileEngine;
