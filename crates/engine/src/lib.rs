//! Access coordination for custodian
//!
//! This crate sits in front of a store engine and makes multi-threaded use
//! of it safe:
//! - StoreAccess: one owning handle on a dedicated owning thread,
//!   short-lived handles everywhere else
//! - Dispatch: synchronous reads/writes on any thread, asynchronous ones on
//!   a worker pool
//! - Subscriptions: live queries delivered on the owning thread, torn down
//!   and re-established around maintenance
//! - Maintenance: blocking windows with compaction, backups
//! - File lifecycle: versioned filenames, newer-version recovery, corrupt
//!   file fresh start
//!
//! # Example
//!
//! ```ignore
//! let access = StoreAccess::builder(AccessConfig::new(dir, "client"))
//!     .schema(Schema::new(1, ["Score"]))
//!     .open()?;
//!
//! access.write(|txn| Ok(txn.insert("Score", json!({ "total": 10 }))?))?;
//! let count = access.read(|h| Ok(h.query(&Query::all("Score"))?.len()))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod async_op;
pub mod config;
pub mod dispatch;
pub mod files;
pub mod gate;
pub mod handles;
pub mod maintenance;
pub mod metrics;
pub mod migration;
pub mod owner;
pub mod pending;
pub mod pool;
pub mod subscriptions;

pub use access::{AccessBuilder, StartupCleanup, StoreAccess};
pub use async_op::{AsyncOperation, CancellationToken};
pub use config::{AccessConfig, CONFIG_FILE_NAME, STORE_EXTENSION};
pub use dispatch::run_in_transaction;
pub use files::StoreFiles;
pub use gate::{HandleLimiter, OpeningGate};
pub use handles::ShortLivedHandle;
pub use maintenance::{BlockGuard, MaintenanceState};
pub use metrics::{AccessCounters, AccessStats, Affinity, MetricsSink, NoopMetrics};
pub use migration::{MigrationRegistry, MigrationStep};
pub use owner::OwnerExecutor;
pub use pending::PendingOperations;
pub use pool::{Mailbox, PoolStats, WorkerPool};
pub use subscriptions::{ChangeCallback, CustomRegistration, Subscription, SubscriptionId, Teardown};
