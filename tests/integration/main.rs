//! Integration tests for the access coordination layer
//!
//! - scenarios: end-to-end read, write and subscription flows
//! - threading: thread affinity, reentrancy and async dispatch
//! - maintenance: blocking windows, compaction and backups
//! - recovery: first-access recovery and migrations
//! - pending: in-flight accounting across thread kinds

#[path = "../common/mod.rs"]
mod common;

mod maintenance;
mod pending;
mod recovery;
mod scenarios;
mod threading;
