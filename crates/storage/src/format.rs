//! Store file format.
//!
//! A store is a single file: a fixed header followed by commit frames. Every
//! commit appends one frame; compaction rewrites the file as one snapshot
//! frame.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ File Header (32 bytes)             │
//! ├────────────────────────────────────┤
//! │ Frame 1                            │
//! ├────────────────────────────────────┤
//! │ Frame 2                            │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Frame Layout
//!
//! ```text
//! ┌─────────────────┬──────────────────┬─────────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1)   │ Payload (variable)      │ CRC32 (4)│
//! └─────────────────┴──────────────────┴─────────────────────────┴──────────┘
//! ```
//!
//! The length covers format version, payload and CRC. The CRC covers format
//! version and payload. The payload is a MessagePack-encoded `Vec<Op>`.

use crc32fast::Hasher;
use custodian_core::{EngineError, EngineResult, Record, RecordId, SchemaVersion};
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a store file: "CSTD"
pub const FILE_MAGIC: [u8; 4] = *b"CSTD";

/// Current file format version
pub const FILE_FORMAT_VERSION: u32 = 1;

/// Size of the file header in bytes
pub const FILE_HEADER_SIZE: usize = 32;

/// Current frame format version
pub const FRAME_FORMAT_VERSION: u8 = 1;

/// Store file header (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Magic bytes: "CSTD"
    pub magic: [u8; 4],

    /// File format version
    pub format_version: u32,

    /// Schema version the contents were written at
    pub schema_version: SchemaVersion,
}

impl FileHeader {
    /// Create a header for a file at `schema_version`.
    pub fn new(schema_version: SchemaVersion) -> Self {
        FileHeader {
            magic: FILE_MAGIC,
            format_version: FILE_FORMAT_VERSION,
            schema_version,
        }
    }

    /// Serialize header to bytes. Bytes 16..32 are reserved (zero).
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.schema_version.as_u64().to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; FILE_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        FileHeader {
            magic,
            format_version: read_u32(bytes, 4).unwrap_or_default(),
            schema_version: SchemaVersion::new(read_u64(bytes, 8).unwrap_or_default()),
        }
    }

    /// Validate the header has correct magic bytes.
    pub fn is_valid(&self) -> bool {
        self.magic == FILE_MAGIC
    }
}

/// One mutation recorded in a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Insert or replace a record
    Put(Record),
    /// Delete a record
    Remove(RecordId),
    /// Raise the id allocator to at least this value
    Reserve(u64),
}

/// Frame parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not enough data to parse the frame
    #[error("Insufficient data to parse frame")]
    InsufficientData,

    /// Frame format is invalid
    #[error("Invalid frame format")]
    InvalidFormat,

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the frame
        expected: u32,
        /// Checksum of the bytes read
        computed: u32,
    },

    /// Unsupported format version
    #[error("Unsupported frame format version: {0}")]
    UnsupportedVersion(u8),

    /// Payload could not be decoded
    #[error("Undecodable frame payload: {0}")]
    Payload(String),
}

impl FrameError {
    /// Map a frame error found at `offset` to the engine's error kinds.
    pub fn at_offset(self, offset: usize) -> EngineError {
        match self {
            FrameError::InsufficientData => {
                EngineError::Truncated(format!("incomplete frame at offset {}", offset))
            }
            other => EngineError::Corrupt(format!("{} at offset {}", other, offset)),
        }
    }
}

/// Serialize a frame.
pub fn encode_frame(ops: &[Op]) -> EngineResult<Vec<u8>> {
    let encoded = rmp_serde::to_vec_named(ops)
        .map_err(|e| EngineError::InvalidState(format!("failed to encode frame: {}", e)))?;

    let mut payload = Vec::with_capacity(1 + encoded.len());
    payload.push(FRAME_FORMAT_VERSION);
    payload.extend_from_slice(&encoded);

    let crc = compute_crc(&payload);

    let total_len = payload.len() + 4;
    let mut frame = Vec::with_capacity(4 + total_len);
    frame.extend_from_slice(&(total_len as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Deserialize one frame.
///
/// Returns (ops, bytes_consumed) on success.
pub fn decode_frame(bytes: &[u8]) -> Result<(Vec<Op>, usize), FrameError> {
    let length = read_u32(bytes, 0).ok_or(FrameError::InsufficientData)? as usize;

    // Minimum: 1 byte format version + 4 bytes CRC
    if length < 5 {
        return Err(FrameError::InvalidFormat);
    }

    let body = bytes
        .get(4..4usize.saturating_add(length))
        .ok_or(FrameError::InsufficientData)?;

    let (payload, crc_bytes) = body.split_at(length - 4);
    let stored_crc = read_u32(crc_bytes, 0).ok_or(FrameError::InvalidFormat)?;
    let computed_crc = compute_crc(payload);
    if computed_crc != stored_crc {
        return Err(FrameError::ChecksumMismatch {
            expected: stored_crc,
            computed: computed_crc,
        });
    }

    if payload[0] != FRAME_FORMAT_VERSION {
        return Err(FrameError::UnsupportedVersion(payload[0]));
    }

    let ops: Vec<Op> =
        rmp_serde::from_slice(&payload[1..]).map_err(|e| FrameError::Payload(e.to_string()))?;

    Ok((ops, 4 + length))
}

/// Decoded contents of a store file
#[derive(Debug)]
pub struct DecodedFile {
    /// Schema version recorded in the header
    pub schema_version: SchemaVersion,
    /// Frames in file order
    pub frames: Vec<Vec<Op>>,
}

/// Decode a whole store file opened at `target`.
///
/// The header's schema version is checked before any frame is read, so a
/// file from a newer binary reports [`EngineError::SchemaTooNew`] even if its
/// frames use an unknown encoding.
pub fn decode_file(bytes: &[u8], target: SchemaVersion) -> EngineResult<DecodedFile> {
    let header_bytes: &[u8; FILE_HEADER_SIZE] = bytes
        .get(..FILE_HEADER_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            EngineError::Truncated(format!(
                "file header is {} bytes, expected {}",
                bytes.len(),
                FILE_HEADER_SIZE
            ))
        })?;

    let header = FileHeader::from_bytes(header_bytes);
    if !header.is_valid() {
        return Err(EngineError::Corrupt("invalid file magic bytes".to_string()));
    }
    if header.format_version != FILE_FORMAT_VERSION {
        return Err(EngineError::Corrupt(format!(
            "unsupported file format version {}",
            header.format_version
        )));
    }
    if header.schema_version > target {
        return Err(EngineError::SchemaTooNew {
            file: header.schema_version,
            target,
        });
    }

    let mut frames = Vec::new();
    let mut offset = FILE_HEADER_SIZE;
    while offset < bytes.len() {
        let (ops, consumed) = decode_frame(&bytes[offset..]).map_err(|e| e.at_offset(offset))?;
        frames.push(ops);
        offset += consumed;
    }

    Ok(DecodedFile {
        schema_version: header.schema_version,
        frames,
    })
}

/// Position of a torn final frame, as left by a crash mid-append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateInfo {
    /// Position where valid data ends
    pub valid_end: u64,
    /// Original file size
    pub original_size: u64,
}

impl TruncateInfo {
    /// Get the number of bytes that need to be truncated.
    pub fn bytes_to_truncate(&self) -> u64 {
        self.original_size - self.valid_end
    }
}

/// Find a torn tail: every frame before it decodes and only the last one is
/// incomplete.
///
/// Returns `None` for an intact file, a bad header, or damage that is not
/// confined to an incomplete final frame.
pub fn torn_tail(bytes: &[u8]) -> Option<TruncateInfo> {
    let header_bytes: &[u8; FILE_HEADER_SIZE] = bytes.get(..FILE_HEADER_SIZE)?.try_into().ok()?;
    if !FileHeader::from_bytes(header_bytes).is_valid() {
        return None;
    }

    let mut offset = FILE_HEADER_SIZE;
    while offset < bytes.len() {
        match decode_frame(&bytes[offset..]) {
            Ok((_, consumed)) => offset += consumed,
            Err(FrameError::InsufficientData) => {
                return Some(TruncateInfo {
                    valid_end: offset as u64,
                    original_size: bytes.len() as u64,
                })
            }
            Err(_) => return None,
        }
    }
    None
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let raw: [u8; 8] = bytes.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}
