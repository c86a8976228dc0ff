//! Data manager - routes chunk and buffer requests across the ordered
//! memory-level chain.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::PinnedBuffer;
use crate::common::config::DataMgrConfig;
use crate::common::{ChunkKey, DeviceId, Error, MemoryLevel, Result};
use crate::encoder::ChunkMetadata;
use crate::mgr::{CacheStatsSnapshot, DiskMgr, LevelBufferMgr, MemoryBufferMgr};

/// Orchestrates one buffer manager per memory level and device.
///
/// # Architecture
/// ```text
/// ┌───────────────────────────────────────────────────────────────┐
/// │                          DataMgr                              │
/// │   level 2 (GPU):   [MemoryBufferMgr dev0] [dev1] ...          │
/// │   level 1 (CPU):   [MemoryBufferMgr dev0]                     │
/// │   level 0 (DISK):  [DiskMgr]                                  │
/// │                                                               │
/// │   get_chunk: promote upward, copy-on-miss, hop by hop         │
/// │   checkpoint: flush downward, top tier first                  │
/// └───────────────────────────────────────────────────────────────┘
/// ```
///
/// Chunk-keyed operations address device 0 of a level; key-less buffer
/// operations take an explicit device for multi-GPU use.
///
/// # Usage
/// ```no_run
/// use stratadb::{ChunkKey, DataMgr, DataMgrConfig, MemoryLevel};
///
/// let mgr = DataMgr::new(DataMgrConfig::default(), "data/").unwrap();
/// let key = ChunkKey::of_fragment(1, 1, 1, 0);
/// let chunk = mgr.create_chunk(MemoryLevel::Disk, &key, 4096).unwrap();
/// chunk.append(b"column bytes").unwrap();
/// drop(chunk);
/// mgr.checkpoint().unwrap();
/// ```
pub struct DataMgr {
    /// `mgrs[level][device]`, in promotion order.
    mgrs: Vec<Vec<Arc<dyn LevelBufferMgr>>>,
    config: DataMgrConfig,
}

impl DataMgr {
    /// Build the level chain from `config`, storing durable data under
    /// `data_dir`.
    pub fn new<P: AsRef<Path>>(config: DataMgrConfig, data_dir: P) -> Result<Self> {
        let disk: Arc<dyn LevelBufferMgr> =
            Arc::new(DiskMgr::new(data_dir.as_ref(), config.page_size)?);
        let cpu: Arc<dyn LevelBufferMgr> = Arc::new(MemoryBufferMgr::new(
            MemoryLevel::Cpu,
            DeviceId::HOST,
            config.cpu_pool_bytes,
            &config,
        ));
        let mut mgrs = vec![vec![disk], vec![cpu]];
        if config.num_gpus > 0 {
            let gpus = (0..config.num_gpus)
                .map(|device| {
                    Arc::new(MemoryBufferMgr::new(
                        MemoryLevel::Gpu,
                        DeviceId::new(device as i32),
                        config.gpu_pool_bytes,
                        &config,
                    )) as Arc<dyn LevelBufferMgr>
                })
                .collect();
            mgrs.push(gpus);
        }
        Ok(Self { mgrs, config })
    }

    pub fn config(&self) -> &DataMgrConfig {
        &self.config
    }

    /// Number of configured levels.
    pub fn level_count(&self) -> usize {
        self.mgrs.len()
    }

    /// Number of devices at a level, 0 if the level is not configured.
    pub fn device_count(&self, level: MemoryLevel) -> usize {
        self.mgrs.get(level.index()).map_or(0, |devs| devs.len())
    }

    fn mgr(&self, level: MemoryLevel, device: DeviceId) -> Result<&Arc<dyn LevelBufferMgr>> {
        self.mgrs
            .get(level.index())
            .and_then(|devs| devs.get(device.0 as usize))
            .ok_or(Error::UnknownDevice { level, device })
    }

    // ========================================================================
    // Chunk operations
    // ========================================================================

    /// Register a new chunk at `level`, pre-sized to `num_bytes`.
    pub fn create_chunk(
        &self,
        level: MemoryLevel,
        key: &ChunkKey,
        num_bytes: usize,
    ) -> Result<PinnedBuffer> {
        self.mgr(level, DeviceId::HOST)?.create_chunk(key, num_bytes)
    }

    /// Pin the chunk at `level`, materializing it there if needed by
    /// copying up from the nearest lower level that holds it.
    ///
    /// `num_bytes` is a capacity hint for materialization; 0 means the
    /// stored size.
    ///
    /// # Errors
    /// `Error::ChunkNotFound` if the key exists at no level.
    pub fn get_chunk(
        &self,
        level: MemoryLevel,
        key: &ChunkKey,
        num_bytes: usize,
    ) -> Result<PinnedBuffer> {
        let target = self.mgr(level, DeviceId::HOST)?;
        match target.get_chunk(key, num_bytes) {
            Ok(pb) => return Ok(pb),
            Err(Error::ChunkNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // Nearest lower level holding the chunk.
        let mut source = None;
        for lvl in (0..level.index()).rev() {
            if self.mgrs[lvl][0].has_chunk(key) {
                source = Some(lvl);
                break;
            }
        }
        let Some(mut lvl) = source else {
            return Err(Error::ChunkNotFound(key.clone()));
        };

        // Copy hop by hop toward the target. The source stays pinned
        // while each destination manager inserts and pins its copy under
        // its own allocation lock.
        let mut current = self.mgrs[lvl][0].get_chunk(key, num_bytes)?;
        while lvl < level.index() {
            lvl += 1;
            let dest = &self.mgrs[lvl][0];
            let stats = current.encoder_snapshot();
            let next = {
                let src = current.entry().buffer();
                dest.put_chunk(key, &src, stats)?
            };
            debug!(key = %key, level = %dest.level(), "promoted chunk");
            current = next;
        }
        Ok(current)
    }

    /// Remove the chunk from every level. Idempotent: an absent key is a
    /// no-op everywhere.
    pub fn delete_chunk(&self, key: &ChunkKey) -> Result<()> {
        for level in &self.mgrs {
            for mgr in level {
                mgr.delete_chunk(key)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Key-less buffer operations
    // ========================================================================

    /// Allocate a transient buffer at a specific level and device.
    pub fn create_buffer(
        &self,
        level: MemoryLevel,
        device: DeviceId,
        num_bytes: usize,
    ) -> Result<PinnedBuffer> {
        self.mgr(level, device)?.create_buffer(num_bytes)
    }

    /// Release a transient buffer, consuming its handle.
    pub fn delete_buffer(&self, buffer: PinnedBuffer) -> Result<()> {
        let mgr = self.mgr(buffer.level(), buffer.device())?;
        mgr.delete_buffer(buffer.entry().id())
    }

    /// Allocate a buffer at `level`/`device` sized to `src` and copy its
    /// bytes, preserving used size, dirty state and epoch.
    pub fn copy_buffer(
        &self,
        level: MemoryLevel,
        device: DeviceId,
        src: &PinnedBuffer,
    ) -> Result<PinnedBuffer> {
        let dst = self.mgr(level, device)?.create_buffer(src.capacity())?;
        {
            let s = src.entry().buffer();
            let mut d = dst.entry().buffer_mut();
            d.write(s.used_memory(), 0)?;
            d.set_used(s.used());
            if !s.is_dirty() {
                d.force_clean();
            }
            d.set_epoch(s.epoch());
        }
        Ok(dst)
    }

    // ========================================================================
    // Checkpoint and metadata
    // ========================================================================

    /// Flush all dirty chunks down to durable storage.
    ///
    /// Dirty data migrates one level at a time, top cache tier first, so
    /// GPU writes pass through the CPU tier before the disk level
    /// persists everything. Cache dirty flags clear and epochs advance
    /// only after the disk checkpoint succeeded.
    pub fn checkpoint(&self) -> Result<()> {
        // (level, device, keys) flushed from each cache manager.
        let mut flushed = Vec::new();
        for lvl in (1..self.mgrs.len()).rev() {
            for (device, mgr) in self.mgrs[lvl].iter().enumerate() {
                let below = &self.mgrs[lvl - 1][0];
                let keys = mgr.dirty_chunks();
                for key in &keys {
                    let src = mgr.get_chunk(key, 0)?;
                    let stats = src.encoder_snapshot();
                    let guard = src.entry().buffer();
                    below.put_chunk(key, &guard, stats)?;
                }
                if !keys.is_empty() {
                    flushed.push((lvl, device, keys));
                }
            }
        }

        self.mgrs[0][0].checkpoint()?;

        for (lvl, device, keys) in flushed {
            self.mgrs[lvl][device].clear_dirty_after_checkpoint(&keys);
        }
        debug!("checkpoint complete");
        Ok(())
    }

    /// Statistics of every chunk known to the durable level, sorted by
    /// key.
    pub fn chunk_metadata_vec(&self) -> Vec<(ChunkKey, ChunkMetadata)> {
        self.mgrs[0][0].chunk_metadata(None)
    }

    /// Statistics of durable chunks whose keys share `prefix`.
    pub fn chunk_metadata_vec_for_key_prefix(
        &self,
        prefix: &ChunkKey,
    ) -> Vec<(ChunkKey, ChunkMetadata)> {
        self.mgrs[0][0].chunk_metadata(Some(prefix))
    }

    /// Cache counters for a level manager, if it keeps any.
    pub fn cache_stats(&self, level: MemoryLevel, device: DeviceId) -> Option<CacheStatsSnapshot> {
        self.mgr(level, device).ok()?.stats()
    }
}
