//! Reference store engine for custodian
//!
//! This crate implements a small embedded object store with:
//! - FileEngine: the store engine entry point (open, compact)
//! - Single-file format: 32-byte header plus CRC-checked commit frames
//! - One shared in-memory state per file, one writer at a time
//! - Live queries with inserted/removed/modified diffs
//! - Schema version checks and migration on open
//!
//! # Durability
//!
//! Every commit appends one frame and syncs it before the new state becomes
//! visible. Compaction rewrites the file as a single snapshot frame through a
//! temporary file and an atomic rename.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod format;
pub mod shared;
pub mod state;

pub use engine::{FileEngine, FileHandle};
pub use format::{torn_tail, FileHeader, FrameError, Op, TruncateInfo, FILE_HEADER_SIZE, FILE_MAGIC};
pub use shared::{SharedFile, OPEN_FILES};
pub use state::StoreState;
