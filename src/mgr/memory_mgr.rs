//! In-memory buffer manager for the CPU and GPU cache tiers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::{Buffer, BufferEntry, PinnedBuffer};
use crate::common::config::DataMgrConfig;
use crate::common::{ChunkKey, DeviceId, Error, MemoryLevel, Result};
use crate::encoder::{new_encoder, ChunkMetadata, EncodingSpec};
use crate::mgr::{CacheStats, CacheStatsSnapshot, LevelBufferMgr};

/// A byte-budgeted cache tier holding promoted chunk copies and
/// transient buffers.
///
/// # Architecture
/// ```text
/// ┌──────────────────────────────────────────────────────────────┐
/// │                      MemoryBufferMgr                         │
/// │  ┌───────────────┐  ┌───────────────┐  ┌─────────────────┐  │
/// │  │ chunks        │  │ transients    │  │ eviction queue  │  │
/// │  │ ChunkKey →    │  │ id →          │  │ FIFO of chunk   │  │
/// │  │ BufferEntry   │  │ BufferEntry   │  │ keys            │  │
/// │  └───────────────┘  └───────────────┘  └─────────────────┘  │
/// │        used_bytes ≤ budget, slab-granular allocations        │
/// └──────────────────────────────────────────────────────────────┘
/// ```
///
/// Eviction is FIFO over chunk keys and only ever selects clean,
/// unpinned buffers: dirty data leaves a cache tier exclusively through
/// a checkpoint. Exhausting the queue without freeing enough space is an
/// `OutOfMemory` error escalated to the caller, which may checkpoint or
/// retry at a lower level.
pub struct MemoryBufferMgr {
    level: MemoryLevel,
    device: DeviceId,
    budget: usize,
    page_size: usize,
    min_slab: usize,
    max_slab: usize,
    state: Mutex<MemState>,
    stats: CacheStats,
}

struct MemState {
    chunks: HashMap<ChunkKey, Arc<BufferEntry>>,
    transients: HashMap<u64, Arc<BufferEntry>>,
    /// FIFO eviction order over chunk keys.
    queue: VecDeque<ChunkKey>,
    /// Membership set for the queue, kept in lockstep.
    in_queue: HashSet<ChunkKey>,
    used_bytes: usize,
    next_id: u64,
}

impl MemoryBufferMgr {
    pub fn new(
        level: MemoryLevel,
        device: DeviceId,
        budget: usize,
        config: &DataMgrConfig,
    ) -> Self {
        assert!(level.is_cache(), "MemoryBufferMgr only serves cache tiers");
        Self {
            level,
            device,
            budget,
            page_size: config.page_size,
            min_slab: config.min_slab_bytes,
            max_slab: config.max_slab_bytes,
            state: Mutex::new(MemState {
                chunks: HashMap::new(),
                transients: HashMap::new(),
                queue: VecDeque::new(),
                in_queue: HashSet::new(),
                used_bytes: 0,
                next_id: 0,
            }),
            stats: CacheStats::new(),
        }
    }

    /// Bytes currently allocated to buffers.
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    /// Number of resident chunks.
    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Round a request up to the slab granularity.
    fn slab_bytes(&self, num_bytes: usize) -> Result<usize> {
        let alloc = num_bytes
            .max(1)
            .div_ceil(self.page_size)
            .checked_mul(self.page_size)
            .unwrap_or(usize::MAX)
            .max(self.min_slab);
        if alloc > self.max_slab {
            return Err(Error::MaxSlabExceeded {
                requested: num_bytes,
                max: self.max_slab,
            });
        }
        Ok(alloc)
    }

    /// Evict clean, unpinned chunks until `need` more bytes fit.
    ///
    /// Pinned or dirty candidates are skipped and re-queued in order.
    fn ensure_space(&self, state: &mut MemState, need: usize, requested: usize) -> Result<()> {
        let mut skipped = Vec::new();
        while state.used_bytes + need > self.budget {
            let Some(key) = state.queue.pop_front() else {
                break;
            };
            state.in_queue.remove(&key);
            let evictable = match state.chunks.get(&key) {
                Some(entry) => {
                    if entry.is_pinned() || entry.is_dirty() {
                        skipped.push(key);
                        continue;
                    }
                    true
                }
                // Stale queue residue from a deleted chunk.
                None => false,
            };
            if evictable {
                let entry = state
                    .chunks
                    .remove(&key)
                    .expect("entry present under state lock");
                state.used_bytes -= entry.capacity();
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, level = %self.level, device = %self.device, "evicted chunk");
            }
        }
        let fits = state.used_bytes + need <= self.budget;
        for key in skipped {
            if state.in_queue.insert(key.clone()) {
                state.queue.push_back(key);
            }
        }
        if fits {
            Ok(())
        } else {
            Err(Error::OutOfMemory {
                level: self.level,
                device: self.device,
                requested,
            })
        }
    }

    fn new_entry(
        &self,
        state: &mut MemState,
        key: Option<ChunkKey>,
        capacity: usize,
        epoch: u32,
    ) -> Arc<BufferEntry> {
        let id = state.next_id;
        state.next_id += 1;
        let buf = Buffer::with_capacity(capacity, self.page_size, epoch);
        let entry = Arc::new(BufferEntry::new(buf, self.level, self.device, key, id));
        state.used_bytes += entry.capacity();
        entry
    }

    fn bind_encoder(entry: &BufferEntry, stats: Option<(EncodingSpec, ChunkMetadata)>) {
        if let Some((spec, md)) = stats {
            let mut encoder = new_encoder(spec);
            encoder.copy_metadata(&md);
            *entry.encoder_slot() = Some(encoder);
        }
    }
}

impl LevelBufferMgr for MemoryBufferMgr {
    fn level(&self) -> MemoryLevel {
        self.level
    }

    fn device(&self) -> DeviceId {
        self.device
    }

    fn create_chunk(&self, key: &ChunkKey, num_bytes: usize) -> Result<PinnedBuffer> {
        let alloc = self.slab_bytes(num_bytes)?;
        let mut state = self.state.lock();
        if state.chunks.contains_key(key) {
            return Err(Error::ChunkExists(key.clone(), self.level));
        }
        self.ensure_space(&mut state, alloc, num_bytes)?;

        let entry = self.new_entry(&mut state, Some(key.clone()), alloc, 0);
        state.chunks.insert(key.clone(), Arc::clone(&entry));
        if state.in_queue.insert(key.clone()) {
            state.queue.push_back(key.clone());
        }
        entry.pin();
        Ok(PinnedBuffer::adopt(entry))
    }

    fn get_chunk(&self, key: &ChunkKey, _num_bytes: usize) -> Result<PinnedBuffer> {
        let state = self.state.lock();
        match state.chunks.get(key) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                entry.pin();
                Ok(PinnedBuffer::adopt(Arc::clone(entry)))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Err(Error::ChunkNotFound(key.clone()))
            }
        }
    }

    fn has_chunk(&self, key: &ChunkKey) -> bool {
        self.state.lock().chunks.contains_key(key)
    }

    fn put_chunk(
        &self,
        key: &ChunkKey,
        src: &Buffer,
        stats: Option<(EncodingSpec, ChunkMetadata)>,
    ) -> Result<PinnedBuffer> {
        let mut state = self.state.lock();

        // Reuse a resident buffer that is big enough.
        if let Some(entry) = state.chunks.get(key).map(Arc::clone) {
            if entry.capacity() >= src.used() {
                {
                    let mut buf = entry.buffer_mut();
                    buf.write(src.used_memory(), 0)?;
                    buf.set_used(src.used());
                    if !src.is_dirty() {
                        buf.force_clean();
                    }
                    buf.set_epoch(src.epoch());
                }
                Self::bind_encoder(&entry, stats);
                entry.pin();
                return Ok(PinnedBuffer::adopt(entry));
            }
            if entry.is_pinned() {
                return Err(Error::BufferPinned(key.clone()));
            }
            state.chunks.remove(key);
            state.used_bytes -= entry.capacity();
        }

        let alloc = self.slab_bytes(src.used())?;
        self.ensure_space(&mut state, alloc, src.used())?;
        let entry = self.new_entry(&mut state, Some(key.clone()), alloc, src.epoch());
        {
            let mut buf = entry.buffer_mut();
            buf.write(src.used_memory(), 0)?;
            buf.set_used(src.used());
            if !src.is_dirty() {
                buf.force_clean();
            }
        }
        Self::bind_encoder(&entry, stats);
        state.chunks.insert(key.clone(), Arc::clone(&entry));
        if state.in_queue.insert(key.clone()) {
            state.queue.push_back(key.clone());
        }
        entry.pin();
        Ok(PinnedBuffer::adopt(entry))
    }

    fn delete_chunk(&self, key: &ChunkKey) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.chunks.get(key) {
            if entry.is_pinned() {
                return Err(Error::BufferPinned(key.clone()));
            }
            let entry = state
                .chunks
                .remove(key)
                .expect("entry present under state lock");
            state.used_bytes -= entry.capacity();
            state.in_queue.remove(key);
        }
        Ok(())
    }

    fn create_buffer(&self, num_bytes: usize) -> Result<PinnedBuffer> {
        let alloc = self.slab_bytes(num_bytes)?;
        let mut state = self.state.lock();
        self.ensure_space(&mut state, alloc, num_bytes)?;
        let entry = self.new_entry(&mut state, None, alloc, 0);
        state.transients.insert(entry.id(), Arc::clone(&entry));
        entry.pin();
        Ok(PinnedBuffer::adopt(entry))
    }

    fn delete_buffer(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.transients.remove(&id) {
            state.used_bytes -= entry.capacity();
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        // Cache tiers persist nothing; dirty data flows down through the
        // data manager's checkpoint.
        Ok(())
    }

    fn dirty_chunks(&self) -> Vec<ChunkKey> {
        let state = self.state.lock();
        let mut keys: Vec<ChunkKey> = state
            .chunks
            .iter()
            .filter(|(_, e)| e.is_dirty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn clear_dirty_after_checkpoint(&self, keys: &[ChunkKey]) {
        let state = self.state.lock();
        for key in keys {
            if let Some(entry) = state.chunks.get(key) {
                let mut buf = entry.buffer_mut();
                if buf.is_dirty() {
                    buf.clear_dirty_and_advance_epoch();
                }
            }
        }
    }

    fn chunk_metadata(&self, prefix: Option<&ChunkKey>) -> Vec<(ChunkKey, ChunkMetadata)> {
        let state = self.state.lock();
        let mut out: Vec<(ChunkKey, ChunkMetadata)> = state
            .chunks
            .iter()
            .filter(|(key, _)| prefix.map_or(true, |p| p.is_prefix_of(key)))
            .filter_map(|(key, entry)| {
                entry
                    .encoder_slot()
                    .as_ref()
                    .map(|enc| (key.clone(), enc.metadata()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn stats(&self) -> Option<CacheStatsSnapshot> {
        Some(self.stats.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr_with_budget(budget: usize) -> MemoryBufferMgr {
        let config = DataMgrConfig {
            page_size: 64,
            min_slab_bytes: 64,
            max_slab_bytes: 1024,
            ..DataMgrConfig::default()
        };
        MemoryBufferMgr::new(MemoryLevel::Cpu, DeviceId::HOST, budget, &config)
    }

    fn key(fragment: i32) -> ChunkKey {
        ChunkKey::of_fragment(1, 1, 1, fragment)
    }

    #[test]
    fn test_create_and_get() {
        let mgr = mgr_with_budget(1024);
        {
            let pb = mgr.create_chunk(&key(0), 100).unwrap();
            pb.append(&[1, 2, 3]).unwrap();
        }
        let pb = mgr.get_chunk(&key(0), 0).unwrap();
        assert_eq!(&*pb.memory(), &[1, 2, 3]);
        assert_eq!(mgr.stats().unwrap().hits, 1);
    }

    #[test]
    fn test_create_existing_fails() {
        let mgr = mgr_with_budget(1024);
        let _pb = mgr.create_chunk(&key(0), 10).unwrap();
        assert!(matches!(
            mgr.create_chunk(&key(0), 10).unwrap_err(),
            Error::ChunkExists(_, MemoryLevel::Cpu)
        ));
    }

    #[test]
    fn test_slab_rounding() {
        let mgr = mgr_with_budget(4096);
        let pb = mgr.create_chunk(&key(0), 100).unwrap();
        // 100 bytes rounds up to two 64-byte pages.
        assert_eq!(pb.capacity(), 128);
        assert_eq!(mgr.used_bytes(), 128);
    }

    #[test]
    fn test_max_slab_rejected() {
        let mgr = mgr_with_budget(1 << 20);
        assert!(matches!(
            mgr.create_chunk(&key(0), 4096).unwrap_err(),
            Error::MaxSlabExceeded { max: 1024, .. }
        ));
    }

    #[test]
    fn test_fifo_eviction_of_clean_chunks() {
        let mgr = mgr_with_budget(192); // room for three 64-byte chunks
        for i in 0..3 {
            mgr.create_chunk(&key(i), 10).unwrap();
        }
        assert_eq!(mgr.chunk_count(), 3);

        // A fourth chunk evicts the oldest.
        mgr.create_chunk(&key(3), 10).unwrap();
        assert_eq!(mgr.chunk_count(), 3);
        assert!(!mgr.has_chunk(&key(0)));
        assert!(mgr.has_chunk(&key(3)));
        assert_eq!(mgr.stats().unwrap().evictions, 1);
    }

    #[test]
    fn test_pinned_chunks_survive_eviction() {
        let mgr = mgr_with_budget(128);
        let held = mgr.create_chunk(&key(0), 10).unwrap();
        mgr.create_chunk(&key(1), 10).unwrap();

        // key(0) is pinned by `held`; key(1) must be the victim.
        mgr.create_chunk(&key(2), 10).unwrap();
        assert!(mgr.has_chunk(&key(0)));
        assert!(!mgr.has_chunk(&key(1)));
        drop(held);
    }

    #[test]
    fn test_dirty_chunks_not_evicted() {
        let mgr = mgr_with_budget(128);
        for i in 0..2 {
            let pb = mgr.create_chunk(&key(i), 10).unwrap();
            pb.append(&[9]).unwrap(); // dirty, then unpinned on drop
        }

        // Budget is full and every candidate is dirty.
        let err = mgr.create_chunk(&key(2), 10).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert!(mgr.has_chunk(&key(0)));
        assert!(mgr.has_chunk(&key(1)));
    }

    #[test]
    fn test_out_of_memory_when_all_pinned() {
        let mgr = mgr_with_budget(128);
        let _a = mgr.create_chunk(&key(0), 10).unwrap();
        let _b = mgr.create_chunk(&key(1), 10).unwrap();

        assert!(matches!(
            mgr.create_chunk(&key(2), 10).unwrap_err(),
            Error::OutOfMemory {
                level: MemoryLevel::Cpu,
                ..
            }
        ));
    }

    #[test]
    fn test_delete_chunk_idempotent() {
        let mgr = mgr_with_budget(1024);
        mgr.create_chunk(&key(0), 10).unwrap();
        mgr.delete_chunk(&key(0)).unwrap();
        mgr.delete_chunk(&key(0)).unwrap();
        assert_eq!(mgr.chunk_count(), 0);
        assert_eq!(mgr.used_bytes(), 0);
    }

    #[test]
    fn test_delete_pinned_chunk_fails() {
        let mgr = mgr_with_budget(1024);
        let _pb = mgr.create_chunk(&key(0), 10).unwrap();
        assert!(matches!(
            mgr.delete_chunk(&key(0)).unwrap_err(),
            Error::BufferPinned(_)
        ));
    }

    #[test]
    fn test_put_chunk_copies_content_and_state() {
        let mgr = mgr_with_budget(1024);
        let mut src = Buffer::new(2, 64, 5);
        src.append(&[7, 8, 9]).unwrap();

        let pb = mgr.put_chunk(&key(0), &src, None).unwrap();
        assert_eq!(&*pb.memory(), &[7, 8, 9]);
        assert_eq!(pb.epoch(), 5);
        assert!(pb.is_dirty());

        // A clean source materializes clean.
        src.clear_dirty_and_advance_epoch();
        let pb2 = mgr.put_chunk(&key(1), &src, None).unwrap();
        assert!(!pb2.is_dirty());
        assert_eq!(pb2.epoch(), 6);
    }

    #[test]
    fn test_put_chunk_carries_encoder_stats() {
        let mgr = mgr_with_budget(1024);
        let mut src = Buffer::new(2, 64, 0);
        src.append(&[0u8; 4]).unwrap();

        let md = ChunkMetadata {
            num_elements: 2,
            physical_size: 2,
            min: 1,
            max: 9,
            has_nulls: false,
        };
        let pb = mgr
            .put_chunk(&key(0), &src, Some((EncodingSpec::I32ToI16, md)))
            .unwrap();
        assert_eq!(pb.metadata(), Some(md));

        let listed = mgr.chunk_metadata(None);
        assert_eq!(listed, vec![(key(0), md)]);
    }

    #[test]
    fn test_transient_buffers() {
        let mgr = mgr_with_budget(256);
        let pb = mgr.create_buffer(100).unwrap();
        assert_eq!(pb.capacity(), 128);
        assert!(pb.key().is_none());
        assert_eq!(mgr.used_bytes(), 128);

        let id = pb.entry().id();
        mgr.delete_buffer(id).unwrap();
        assert_eq!(mgr.used_bytes(), 0);
    }

    #[test]
    fn test_clear_dirty_after_checkpoint_bumps_epochs() {
        let mgr = mgr_with_budget(1024);
        {
            let pb = mgr.create_chunk(&key(0), 10).unwrap();
            pb.append(&[1]).unwrap();
        }
        assert_eq!(mgr.dirty_chunks(), vec![key(0)]);

        mgr.clear_dirty_after_checkpoint(&[key(0)]);
        assert!(mgr.dirty_chunks().is_empty());
        let pb = mgr.get_chunk(&key(0), 0).unwrap();
        assert_eq!(pb.epoch(), 1);
    }

    #[test]
    fn test_concurrent_gets() {
        use std::thread;

        let mgr = Arc::new(mgr_with_budget(1024));
        {
            let pb = mgr.create_chunk(&key(0), 10).unwrap();
            pb.append(&[0x42]).unwrap();
        }

        let mut handles = vec![];
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let pb = mgr.get_chunk(&key(0), 0).unwrap();
                    assert_eq!(pb.memory()[0], 0x42);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mgr.stats().unwrap().hits, 800);
    }
}
