//! Disk buffer manager - the durable, authoritative chunk store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::buffer::{Buffer, BufferEntry, PinnedBuffer};
use crate::common::{ChunkKey, DeviceId, Error, MemoryLevel, Result};
use crate::encoder::{new_encoder, ChunkMetadata, EncodingSpec};
use crate::mgr::LevelBufferMgr;
use crate::storage::PageFile;

const DATA_FILE: &str = "chunks.data";
const INDEX_FILE: &str = "chunks.index";

/// Durable record of one chunk in the index.
#[derive(Debug)]
struct DiskChunk {
    /// Data-file pages holding the chunk bytes, in order.
    pages: Vec<u32>,
    used: usize,
    epoch: u32,
    /// CRC32 over the chunk's `[0, used)` bytes as of the last
    /// checkpoint.
    crc: u32,
    encoding: Option<EncodingSpec>,
    metadata: Option<ChunkMetadata>,
}

struct DiskState {
    file: PageFile,
    index: BTreeMap<ChunkKey, DiskChunk>,
    /// Staged buffers: chunks created or written at this level since
    /// they were last trimmed. Clean, unpinned stages are dropped after
    /// a checkpoint and rematerialized from the file on demand.
    entries: HashMap<ChunkKey, Arc<BufferEntry>>,
    transients: HashMap<u64, Arc<BufferEntry>>,
    free_pages: Vec<u32>,
    next_id: u64,
}

/// The level-0 buffer manager.
///
/// Chunk bytes live in a single page file; a separate index file records
/// each chunk's page list, used size, epoch, content CRC and encoder
/// statistics. The index is rewritten atomically (temp file + rename) at
/// every checkpoint, and reloading a data directory restores the full
/// chunk catalog without touching chunk contents.
pub struct DiskMgr {
    page_size: usize,
    index_path: PathBuf,
    state: Mutex<DiskState>,
}

impl DiskMgr {
    /// Open or create a chunk store in `dir`.
    pub fn new<P: AsRef<Path>>(dir: P, page_size: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let data_path = dir.join(DATA_FILE);
        let index_path = dir.join(INDEX_FILE);

        let file = PageFile::open_or_create(&data_path, page_size)?;
        let index = if index_path.exists() {
            load_index(&index_path)?
        } else {
            BTreeMap::new()
        };

        // Pages in the file but not referenced by the index are free.
        let referenced: HashSet<u32> = index.values().flat_map(|c| c.pages.iter().copied()).collect();
        let free_pages: Vec<u32> = (0..file.page_count())
            .filter(|p| !referenced.contains(p))
            .collect();

        Ok(Self {
            page_size,
            index_path,
            state: Mutex::new(DiskState {
                file,
                index,
                entries: HashMap::new(),
                transients: HashMap::new(),
                free_pages,
                next_id: 0,
            }),
        })
    }

    /// Number of chunks known to the durable index.
    pub fn chunk_count(&self) -> usize {
        self.state.lock().index.len()
    }
}

impl LevelBufferMgr for DiskMgr {
    fn level(&self) -> MemoryLevel {
        MemoryLevel::Disk
    }

    fn device(&self) -> DeviceId {
        DeviceId::HOST
    }

    fn create_chunk(&self, key: &ChunkKey, num_bytes: usize) -> Result<PinnedBuffer> {
        let mut state = self.state.lock();
        if state.entries.contains_key(key) || state.index.contains_key(key) {
            return Err(Error::ChunkExists(key.clone(), MemoryLevel::Disk));
        }

        let id = state.next_id;
        state.next_id += 1;
        let buf = Buffer::with_capacity(num_bytes.max(1), self.page_size, 0);
        let entry = Arc::new(BufferEntry::new(
            buf,
            MemoryLevel::Disk,
            DeviceId::HOST,
            Some(key.clone()),
            id,
        ));
        state.index.insert(
            key.clone(),
            DiskChunk {
                pages: Vec::new(),
                used: 0,
                epoch: 0,
                crc: 0,
                encoding: None,
                metadata: None,
            },
        );
        state.entries.insert(key.clone(), Arc::clone(&entry));
        entry.pin();
        Ok(PinnedBuffer::adopt(entry))
    }

    fn get_chunk(&self, key: &ChunkKey, num_bytes: usize) -> Result<PinnedBuffer> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(key) {
            entry.pin();
            return Ok(PinnedBuffer::adopt(Arc::clone(entry)));
        }

        let DiskState {
            file,
            index,
            entries,
            next_id,
            ..
        } = &mut *state;
        let Some(chunk) = index.get(key) else {
            return Err(Error::ChunkNotFound(key.clone()));
        };

        // Rematerialize from the page file.
        let capacity = chunk.used.max(num_bytes).max(1);
        let mut buf = Buffer::with_capacity(capacity, self.page_size, chunk.epoch);
        let mut page = vec![0u8; self.page_size];
        for (i, &page_id) in chunk.pages.iter().enumerate() {
            file.read_page_into(page_id, &mut page)?;
            buf.load_page(i, &page);
        }
        buf.set_used(chunk.used);

        if chunk.used > 0 {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(buf.used_memory());
            if hasher.finalize() != chunk.crc {
                error!(key = %key, "chunk content failed CRC verification");
                return Err(Error::ChecksumMismatch(key.clone()));
            }
        }

        let id = *next_id;
        *next_id += 1;
        let entry = Arc::new(BufferEntry::new(
            buf,
            MemoryLevel::Disk,
            DeviceId::HOST,
            Some(key.clone()),
            id,
        ));
        if let (Some(spec), Some(md)) = (chunk.encoding, chunk.metadata) {
            let mut encoder = new_encoder(spec);
            encoder.copy_metadata(&md);
            *entry.encoder_slot() = Some(encoder);
        }
        entries.insert(key.clone(), Arc::clone(&entry));
        entry.pin();
        Ok(PinnedBuffer::adopt(entry))
    }

    fn has_chunk(&self, key: &ChunkKey) -> bool {
        let state = self.state.lock();
        state.entries.contains_key(key) || state.index.contains_key(key)
    }

    fn put_chunk(
        &self,
        key: &ChunkKey,
        src: &Buffer,
        stats: Option<(EncodingSpec, ChunkMetadata)>,
    ) -> Result<PinnedBuffer> {
        let mut state = self.state.lock();
        if !state.index.contains_key(key) {
            state.index.insert(
                key.clone(),
                DiskChunk {
                    pages: Vec::new(),
                    used: 0,
                    epoch: 0,
                    crc: 0,
                    encoding: None,
                    metadata: None,
                },
            );
        }

        if let Some(entry) = state.entries.get(key).map(Arc::clone) {
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
                bind_encoder(&entry, stats);
                entry.pin();
                return Ok(PinnedBuffer::adopt(entry));
            }
            if entry.is_pinned() {
                return Err(Error::BufferPinned(key.clone()));
            }
            state.entries.remove(key);
        }

        let id = state.next_id;
        state.next_id += 1;
        let mut buf = Buffer::with_capacity(src.used().max(1), self.page_size, src.epoch());
        buf.write(src.used_memory(), 0)?;
        buf.set_used(src.used());
        if !src.is_dirty() {
            buf.force_clean();
        }
        let entry = Arc::new(BufferEntry::new(
            buf,
            MemoryLevel::Disk,
            DeviceId::HOST,
            Some(key.clone()),
            id,
        ));
        bind_encoder(&entry, stats);
        state.entries.insert(key.clone(), Arc::clone(&entry));
        entry.pin();
        Ok(PinnedBuffer::adopt(entry))
    }

    fn delete_chunk(&self, key: &ChunkKey) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(key) {
            if entry.is_pinned() {
                return Err(Error::BufferPinned(key.clone()));
            }
            state.entries.remove(key);
        }
        if let Some(chunk) = state.index.remove(key) {
            state.free_pages.extend(chunk.pages);
        }
        Ok(())
    }

    fn create_buffer(&self, num_bytes: usize) -> Result<PinnedBuffer> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let buf = Buffer::with_capacity(num_bytes.max(1), self.page_size, 0);
        let entry = Arc::new(BufferEntry::new(
            buf,
            MemoryLevel::Disk,
            DeviceId::HOST,
            None,
            id,
        ));
        state.transients.insert(id, Arc::clone(&entry));
        entry.pin();
        Ok(PinnedBuffer::adopt(entry))
    }

    fn delete_buffer(&self, id: u64) -> Result<()> {
        self.state.lock().transients.remove(&id);
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock();
        let DiskState {
            file,
            index,
            entries,
            free_pages,
            ..
        } = &mut *state;

        // Write dirty pages of every dirty staged buffer, holding each
        // buffer's write lock until its flags are cleared so no write
        // can land mid-flush.
        let mut flushed = Vec::new();
        for (key, entry) in entries.iter() {
            let buf = entry.buffer_mut();
            if !buf.is_dirty() {
                continue;
            }
            let Some(chunk) = index.get_mut(key) else {
                continue;
            };

            let needed_pages = buf.used().div_ceil(self.page_size);
            while chunk.pages.len() < needed_pages {
                let page_id = match free_pages.pop() {
                    Some(p) => p,
                    None => file.allocate_page()?,
                };
                chunk.pages.push(page_id);
            }
            while chunk.pages.len() > needed_pages {
                free_pages.push(chunk.pages.pop().expect("page list non-empty"));
            }

            for page_index in buf.dirty_page_indices() {
                if page_index < needed_pages {
                    file.write_page(chunk.pages[page_index], buf.page_memory(page_index))?;
                }
            }

            chunk.used = buf.used();
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(buf.used_memory());
            chunk.crc = hasher.finalize();
            chunk.epoch = buf.epoch() + 1;
            if let Some(encoder) = entry.encoder_slot().as_ref() {
                chunk.encoding = Some(encoder.spec());
                chunk.metadata = Some(encoder.metadata());
            }
            flushed.push((key.clone(), buf));
        }

        file.sync()?;
        write_index(index, &self.index_path)?;

        // Only now that pages and index are durable do the dirty flags
        // clear and epochs advance.
        let count = flushed.len();
        for (_, mut buf) in flushed {
            buf.clear_dirty_and_advance_epoch();
        }

        // Trim clean, unpinned stages; they reload from the file on the
        // next get.
        entries.retain(|_, entry| entry.is_pinned() || entry.is_dirty());

        debug!(chunks = count, "disk checkpoint complete");
        Ok(())
    }

    fn dirty_chunks(&self) -> Vec<ChunkKey> {
        let state = self.state.lock();
        let mut keys: Vec<ChunkKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_dirty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn clear_dirty_after_checkpoint(&self, _keys: &[ChunkKey]) {
        // The disk level clears its own flags inside checkpoint().
    }

    fn chunk_metadata(&self, prefix: Option<&ChunkKey>) -> Vec<(ChunkKey, ChunkMetadata)> {
        let state = self.state.lock();
        state
            .index
            .iter()
            .filter(|(key, _)| prefix.map_or(true, |p| p.is_prefix_of(key)))
            .filter_map(|(key, chunk)| {
                // Prefer live encoder statistics over the last
                // checkpointed record.
                let live = state
                    .entries
                    .get(key)
                    .and_then(|e| e.encoder_slot().as_ref().map(|enc| enc.metadata()));
                live.or(chunk.metadata).map(|md| (key.clone(), md))
            })
            .collect()
    }
}

fn bind_encoder(entry: &BufferEntry, stats: Option<(EncodingSpec, ChunkMetadata)>) {
    if let Some((spec, md)) = stats {
        let mut encoder = new_encoder(spec);
        encoder.copy_metadata(&md);
        *entry.encoder_slot() = Some(encoder);
    }
}

// ============================================================================
// Index file format
// ============================================================================
//
// All fields are raw native-endian fixed-width integers:
//   chunk_count: u64
//   per chunk:
//     key_len: u64, key parts: i32 * key_len
//     used: u64, epoch: u32, crc: u32
//     page_count: u64, pages: u32 * page_count
//     has_stats: u8; if 1: spec_tag: u8, encoder metadata record

fn write_index(index: &BTreeMap<ChunkKey, DiskChunk>, path: &Path) -> Result<()> {
    let tmp_path = path.with_extension("index.tmp");
    {
        let file = fs::File::create(&tmp_path)?;
        let mut w = BufWriter::new(file);

        w.write_all(&(index.len() as u64).to_ne_bytes())?;
        for (key, chunk) in index {
            w.write_all(&(key.len() as u64).to_ne_bytes())?;
            for part in key.parts() {
                w.write_all(&part.to_ne_bytes())?;
            }
            w.write_all(&(chunk.used as u64).to_ne_bytes())?;
            w.write_all(&chunk.epoch.to_ne_bytes())?;
            w.write_all(&chunk.crc.to_ne_bytes())?;
            w.write_all(&(chunk.pages.len() as u64).to_ne_bytes())?;
            for page in &chunk.pages {
                w.write_all(&page.to_ne_bytes())?;
            }
            match (chunk.encoding, chunk.metadata) {
                (Some(spec), Some(md)) => {
                    w.write_all(&[1, spec.tag()])?;
                    let mut encoder = new_encoder(spec);
                    encoder.copy_metadata(&md);
                    encoder.write_metadata(&mut w)?;
                }
                _ => w.write_all(&[0])?,
            }
        }
        w.flush()?;
        w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn load_index(path: &Path) -> Result<BTreeMap<ChunkKey, DiskChunk>> {
    let file = fs::File::open(path)?;
    let mut r = BufReader::new(file);

    let chunk_count = read_u64(&mut r)?;
    let mut index = BTreeMap::new();
    for _ in 0..chunk_count {
        let key_len = read_u64(&mut r)? as usize;
        let mut parts = Vec::with_capacity(key_len);
        for _ in 0..key_len {
            parts.push(read_i32(&mut r)?);
        }
        let key = ChunkKey::new(parts);

        let used = read_u64(&mut r)? as usize;
        let epoch = read_u32(&mut r)?;
        let crc = read_u32(&mut r)?;
        let page_count = read_u64(&mut r)? as usize;
        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            pages.push(read_u32(&mut r)?);
        }

        let (encoding, metadata) = if read_u8(&mut r)? == 1 {
            let tag = read_u8(&mut r)?;
            let spec = EncodingSpec::from_tag(tag).ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown encoding tag {} in chunk index", tag),
                ))
            })?;
            let mut encoder = new_encoder(spec);
            encoder.read_metadata(&mut r)?;
            (Some(spec), Some(encoder.metadata()))
        } else {
            (None, None)
        };

        index.insert(
            key,
            DiskChunk {
                pages,
                used,
                epoch,
                crc,
                encoding,
                metadata,
            },
        );
    }
    Ok(index)
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut raw = [0u8; 1];
    r.read_exact(&mut raw)?;
    Ok(raw[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    Ok(u32::from_ne_bytes(raw))
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut raw = [0u8; 4];
    r.read_exact(&mut raw)?;
    Ok(i32::from_ne_bytes(raw))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut raw = [0u8; 8];
    r.read_exact(&mut raw)?;
    Ok(u64::from_ne_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 64;

    fn key(fragment: i32) -> ChunkKey {
        ChunkKey::of_fragment(1, 1, 1, fragment)
    }

    #[test]
    fn test_create_append_checkpoint_reload() {
        let dir = tempdir().unwrap();
        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();

        {
            let pb = mgr.create_chunk(&key(0), 100).unwrap();
            pb.append(&[1, 2, 3, 4, 5]).unwrap();
        }
        mgr.checkpoint().unwrap();

        // The clean stage was trimmed; this get reloads from the file.
        let pb = mgr.get_chunk(&key(0), 0).unwrap();
        assert_eq!(&*pb.memory(), &[1, 2, 3, 4, 5]);
        assert_eq!(pb.epoch(), 1);
        assert!(!pb.is_dirty());
    }

    #[test]
    fn test_get_unknown_chunk_fails() {
        let dir = tempdir().unwrap();
        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();
        assert!(matches!(
            mgr.get_chunk(&key(9), 0).unwrap_err(),
            Error::ChunkNotFound(_)
        ));
    }

    #[test]
    fn test_reopen_restores_index_and_stats() {
        let dir = tempdir().unwrap();
        let expected;
        {
            let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();
            let pb = mgr.create_chunk(&key(0), 100).unwrap();
            pb.set_encoding(EncodingSpec::I32ToI16);
            let raw: Vec<u8> = [5i32, i32::MIN, 11]
                .iter()
                .flat_map(|v| v.to_ne_bytes())
                .collect();
            let mut src: &[u8] = &raw;
            expected = pb.append_encoded(&mut src, 3).unwrap();
            drop(pb);
            mgr.checkpoint().unwrap();
        }

        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();
        assert_eq!(mgr.chunk_count(), 1);
        let listed = mgr.chunk_metadata(None);
        assert_eq!(listed, vec![(key(0), expected)]);

        let pb = mgr.get_chunk(&key(0), 0).unwrap();
        assert_eq!(pb.used(), 3 * 2);
        assert_eq!(pb.metadata(), Some(expected));
    }

    #[test]
    fn test_checkpoint_writes_only_dirty_pages() {
        let dir = tempdir().unwrap();
        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();

        let pb = mgr.create_chunk(&key(0), 3 * PAGE).unwrap();
        pb.append(&vec![7u8; 3 * PAGE]).unwrap();
        mgr.checkpoint().unwrap();

        // Touch only the middle page and checkpoint again.
        pb.write(&[9], PAGE + 1).unwrap();
        {
            let buf = pb.entry().buffer();
            assert_eq!(buf.dirty_page_indices(), vec![1]);
        }
        mgr.checkpoint().unwrap();
        drop(pb);

        let pb = mgr.get_chunk(&key(0), 0).unwrap();
        let mem = pb.memory();
        assert_eq!(mem[PAGE + 1], 9);
        assert_eq!(mem[0], 7);
        assert_eq!(mem[3 * PAGE - 1], 7);
    }

    #[test]
    fn test_delete_chunk_idempotent_and_frees_pages() {
        let dir = tempdir().unwrap();
        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();

        {
            let pb = mgr.create_chunk(&key(0), PAGE).unwrap();
            pb.append(&[1u8; 10]).unwrap();
        }
        mgr.checkpoint().unwrap();
        assert_eq!(mgr.chunk_count(), 1);

        mgr.delete_chunk(&key(0)).unwrap();
        mgr.delete_chunk(&key(0)).unwrap();
        assert_eq!(mgr.chunk_count(), 0);
        assert!(matches!(
            mgr.get_chunk(&key(0), 0).unwrap_err(),
            Error::ChunkNotFound(_)
        ));

        // The freed page is reused by the next chunk.
        {
            let pb = mgr.create_chunk(&key(1), PAGE).unwrap();
            pb.append(&[2u8; 10]).unwrap();
        }
        mgr.checkpoint().unwrap();
        let state = mgr.state.lock();
        assert_eq!(state.file.page_count(), 1);
    }

    #[test]
    fn test_metadata_prefix_filter() {
        let dir = tempdir().unwrap();
        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();

        for (table, fragment) in [(1, 0), (1, 1), (2, 0)] {
            let k = ChunkKey::of_fragment(1, table, 1, fragment);
            let pb = mgr.create_chunk(&k, PAGE).unwrap();
            pb.set_encoding(EncodingSpec::I16ToI16);
            let raw = 3i16.to_ne_bytes();
            let mut src: &[u8] = &raw;
            pb.append_encoded(&mut src, 1).unwrap();
        }

        let all = mgr.chunk_metadata(None);
        assert_eq!(all.len(), 3);

        let table1 = mgr.chunk_metadata(Some(&ChunkKey::table_prefix(1, 1)));
        assert_eq!(table1.len(), 2);
        assert!(table1
            .iter()
            .all(|(k, _)| ChunkKey::table_prefix(1, 1).is_prefix_of(k)));
    }

    #[test]
    fn test_corrupt_content_detected() {
        let dir = tempdir().unwrap();
        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();
        {
            let pb = mgr.create_chunk(&key(0), PAGE).unwrap();
            pb.append(&[1, 2, 3, 4]).unwrap();
        }
        mgr.checkpoint().unwrap();

        // Flip a byte of the chunk's page behind the manager's back.
        {
            let mut state = mgr.state.lock();
            let page_id = state.index.get(&key(0)).unwrap().pages[0];
            let mut page = vec![0u8; PAGE];
            state.file.read_page_into(page_id, &mut page).unwrap();
            page[0] ^= 0xFF;
            state.file.write_page(page_id, &page).unwrap();
        }

        assert!(matches!(
            mgr.get_chunk(&key(0), 0).unwrap_err(),
            Error::ChecksumMismatch(_)
        ));
    }

    #[test]
    fn test_pinned_stage_survives_checkpoint_trim() {
        let dir = tempdir().unwrap();
        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();

        let pb = mgr.create_chunk(&key(0), PAGE).unwrap();
        pb.append(&[5, 5]).unwrap();
        mgr.checkpoint().unwrap();

        // Still pinned: the stage must not have been trimmed, and the
        // handle keeps working.
        assert_eq!(&*pb.memory(), &[5, 5]);
        assert_eq!(pb.epoch(), 1);
        assert!(mgr.state.lock().entries.contains_key(&key(0)));
    }

    #[test]
    fn test_transient_buffers_not_persisted() {
        let dir = tempdir().unwrap();
        let mgr = DiskMgr::new(dir.path(), PAGE).unwrap();

        let pb = mgr.create_buffer(PAGE).unwrap();
        pb.append(&[1, 2, 3]).unwrap();
        let id = pb.entry().id();
        mgr.checkpoint().unwrap();
        assert_eq!(mgr.chunk_count(), 0);

        mgr.delete_buffer(id).unwrap();
        mgr.delete_buffer(id).unwrap();
    }
}
