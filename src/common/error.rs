//! Error types for stratadb.

use thiserror::Error;

use crate::common::{ChunkKey, DeviceId, MemoryLevel};

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in the buffer layer.
///
/// Errors local to one chunk or buffer abort only the operation that
/// touched it; level exhaustion and I/O failures are escalated to the
/// caller as failures of the whole request. No retry happens inside this
/// layer — callers decide whether to retry at a different memory level.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from disk operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Read past the used portion of a buffer.
    #[error("read of {nbytes} bytes at offset {offset} exceeds used size {used}")]
    ReadPastUsed {
        offset: usize,
        nbytes: usize,
        used: usize,
    },

    /// Write or append past a buffer's fixed capacity.
    #[error("write of {nbytes} bytes at offset {offset} exceeds capacity {capacity}")]
    CapacityExceeded {
        offset: usize,
        nbytes: usize,
        capacity: usize,
    },

    /// A logical value does not survive the round trip through the
    /// physical type. The ingest step that hit it must fail; silently
    /// truncated values would corrupt min/max pruning.
    #[error("fixed-width encoding overflow: {value} does not fit the physical type")]
    EncodingOverflow { value: i64 },

    /// The source slice holds fewer logical values than the append asked
    /// to consume.
    #[error("append source exhausted: needed {needed} bytes, {available} available")]
    TruncatedSource { needed: usize, available: usize },

    /// `get_chunk` on a key absent from every level.
    #[error("chunk {0} not found at any memory level")]
    ChunkNotFound(ChunkKey),

    /// `create_chunk` on a key already present at the target level.
    #[error("chunk {0} already exists at {1} level")]
    ChunkExists(ChunkKey, MemoryLevel),

    /// The chunk's buffer is pinned and cannot be deleted or replaced.
    #[error("chunk {0} is pinned")]
    BufferPinned(ChunkKey),

    /// Encoded append on a buffer with no encoder bound.
    #[error("no encoder bound to buffer")]
    EncoderMissing,

    /// Short read or write of an encoder metadata record. Partial
    /// metadata cannot be trusted for pruning, so this is fatal to the
    /// (de)serialization.
    #[error("short metadata I/O: {source}")]
    MetadataIo { source: std::io::Error },

    /// A level has no room and no eviction candidate.
    #[error("out of memory at {level} {device}: requested {requested} bytes")]
    OutOfMemory {
        level: MemoryLevel,
        device: DeviceId,
        requested: usize,
    },

    /// A single buffer request exceeded the maximum slab size.
    #[error("buffer of {requested} bytes exceeds maximum slab size {max}")]
    MaxSlabExceeded { requested: usize, max: usize },

    /// Durable chunk content failed CRC verification on rematerialize.
    #[error("checksum mismatch reading chunk {0} from disk")]
    ChecksumMismatch(ChunkKey),

    /// Page file access beyond the allocated page count.
    #[error("page {0} not found in page file")]
    PageNotFound(u32),

    /// No manager configured for the requested level/device pair.
    #[error("no buffer manager at {level} {device}")]
    UnknownDevice {
        level: MemoryLevel,
        device: DeviceId,
    },
}
