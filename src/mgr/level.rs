//! The capability interface implemented by every level-local buffer
//! manager.

use crate::buffer::{Buffer, PinnedBuffer};
use crate::common::{ChunkKey, DeviceId, MemoryLevel, Result};
use crate::encoder::{ChunkMetadata, EncodingSpec};
use crate::mgr::CacheStatsSnapshot;

/// One memory level's allocator, as seen by the [`DataMgr`].
///
/// The data manager depends only on this interface; concrete managers
/// (disk, CPU, per-GPU) can be substituted freely, including by test
/// doubles.
///
/// # Pinning contract
/// Every method returning a [`PinnedBuffer`] pins the entry while
/// holding the manager's internal allocation lock, so between the
/// decision to hand a buffer out and the caller receiving the handle
/// there is no window in which eviction could reclaim it.
///
/// [`DataMgr`]: crate::mgr::DataMgr
pub trait LevelBufferMgr: Send + Sync {
    /// The tier this manager allocates at.
    fn level(&self) -> MemoryLevel;

    /// The device within the tier.
    fn device(&self) -> DeviceId;

    /// Register a new chunk and allocate its buffer, pre-sized to at
    /// least `num_bytes`.
    ///
    /// # Errors
    /// `Error::ChunkExists` if the key is already present at this level.
    fn create_chunk(&self, key: &ChunkKey, num_bytes: usize) -> Result<PinnedBuffer>;

    /// Pin and return the chunk's resident buffer at this level.
    ///
    /// Purely local: no cross-level materialization happens here.
    ///
    /// # Errors
    /// `Error::ChunkNotFound` if the chunk is not resident (cache tiers)
    /// or unknown (disk).
    fn get_chunk(&self, key: &ChunkKey, num_bytes: usize) -> Result<PinnedBuffer>;

    /// Whether the chunk is resident at (or, for the disk level, known
    /// to) this manager.
    fn has_chunk(&self, key: &ChunkKey) -> bool;

    /// Materialize a copy of `src` under `key` at this level, preserving
    /// its used size, dirty state and epoch, and optionally carrying the
    /// source's encoder statistics.
    ///
    /// Insertion and pinning happen atomically under the manager's
    /// allocation lock.
    fn put_chunk(
        &self,
        key: &ChunkKey,
        src: &Buffer,
        stats: Option<(EncodingSpec, ChunkMetadata)>,
    ) -> Result<PinnedBuffer>;

    /// Remove the chunk from this level. Idempotent: an absent key is a
    /// no-op.
    ///
    /// # Errors
    /// `Error::BufferPinned` if the resident buffer is still pinned.
    fn delete_chunk(&self, key: &ChunkKey) -> Result<()>;

    /// Allocate a key-less buffer for transient use.
    fn create_buffer(&self, num_bytes: usize) -> Result<PinnedBuffer>;

    /// Release a key-less buffer by its manager-local id. A no-op if the
    /// id is unknown.
    fn delete_buffer(&self, id: u64) -> Result<()>;

    /// Persist this level's dirty state. A no-op for cache tiers.
    fn checkpoint(&self) -> Result<()>;

    /// Keys of all resident dirty chunks.
    fn dirty_chunks(&self) -> Vec<ChunkKey>;

    /// Clear dirty flags and advance epochs of the named chunks after a
    /// successful checkpoint of the level below. Chunks dirtied after
    /// the checkpoint's flush snapshot keep their flags.
    fn clear_dirty_after_checkpoint(&self, keys: &[ChunkKey]);

    /// Chunk statistics known to this level, optionally restricted to
    /// keys sharing `prefix`, sorted by key. Never touches buffer
    /// contents.
    fn chunk_metadata(&self, prefix: Option<&ChunkKey>) -> Vec<(ChunkKey, ChunkMetadata)>;

    /// Cache counters, if this manager keeps any.
    fn stats(&self) -> Option<CacheStatsSnapshot> {
        None
    }
}
