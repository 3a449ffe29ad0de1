//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::Path;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

pub use custodian::{
    AccessConfig, AccessError, ChangeSet, Query, RecordId, ResultSet, Schema, StoreAccess,
    WriteTransaction,
};
pub use serde_json::json;
pub use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness writer.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

// ============================================================================
// Store setup
// ============================================================================

/// Filename every suite uses for the primary store.
pub const STORE_NAME: &str = "client";

/// Config with short compaction timings so blocked tests finish quickly.
pub fn fast_config(dir: &Path) -> AccessConfig {
    AccessConfig {
        compact_retry_interval_ms: 10,
        compact_budget_ms: 500,
        restore_timeout_ms: 2_000,
        drain_timeout_ms: 2_000,
        ..AccessConfig::new(dir, STORE_NAME)
    }
}

/// Schema with a single `Score` type.
pub fn scores_schema(version: u64) -> Schema {
    Schema::new(version, ["Score"])
}

/// Open the scores store in `dir` at schema `version`.
pub fn open_scores(dir: &Path, version: u64) -> StoreAccess {
    init_tracing();
    StoreAccess::builder(fast_config(dir))
        .schema(scores_schema(version))
        .open()
        .unwrap()
}

/// Insert a score with `total` and `user`.
pub fn insert_score(txn: &mut dyn WriteTransaction, user: &str, total: u64) -> RecordId {
    txn.insert("Score", json!({ "user": user, "total": total }))
        .unwrap()
}

/// Number of `Score` records, read from the calling thread.
pub fn score_count(access: &StoreAccess) -> usize {
    access
        .read(|h| Ok(h.query(&Query::all("Score"))?.len()))
        .unwrap()
}

/// Files in `dir` whose name contains `fragment`.
pub fn files_containing(dir: &Path, fragment: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(fragment))
        .collect();
    names.sort();
    names
}

// ============================================================================
// Waiting
// ============================================================================

/// Poll `condition` until it holds or `timeout` expires.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Wait until every job already queued on the owning thread has run,
/// including deliveries those jobs posted.
pub fn flush_owner(access: &StoreAccess) {
    // Jobs run in order; the second round trip lands behind anything the
    // jobs ahead of the first one posted while running.
    access.run_on_owner(|_| Ok(())).unwrap();
    access.run_on_owner(|_| Ok(())).unwrap();
}
