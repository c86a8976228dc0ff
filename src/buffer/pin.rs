//! Pinned buffer handles.
//!
//! A [`PinnedBuffer`] is the only way callers touch resident chunk or
//! transient buffer memory. It holds one pin on the underlying entry for
//! its whole lifetime and releases it on every exit path, so a buffer a
//! caller can still name is never an eviction candidate.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLockReadGuard};

use crate::buffer::BufferEntry;
use crate::common::{ChunkKey, DeviceId, Error, MemoryLevel, Result};
use crate::encoder::{new_encoder, ChunkMetadata, EncodingSpec};

/// RAII pin on a resident buffer.
///
/// Constructed only by level managers, which pin the entry while holding
/// their own allocation lock; dropping the handle releases the pin.
///
/// # Example
/// ```ignore
/// let chunk = data_mgr.get_chunk(MemoryLevel::Cpu, &key, 0)?;
/// let bytes = chunk.memory(); // zero-copy view of the used region
/// // handle drops: pin released, chunk becomes evictable again
/// ```
pub struct PinnedBuffer {
    entry: Arc<BufferEntry>,
}

impl PinnedBuffer {
    /// Wrap an entry that the level manager has already pinned.
    pub(crate) fn adopt(entry: Arc<BufferEntry>) -> Self {
        debug_assert!(entry.is_pinned());
        Self { entry }
    }

    /// The underlying shared entry.
    #[inline]
    pub fn entry(&self) -> &Arc<BufferEntry> {
        &self.entry
    }

    #[inline]
    pub fn level(&self) -> MemoryLevel {
        self.entry.level()
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.entry.device()
    }

    #[inline]
    pub fn key(&self) -> Option<&ChunkKey> {
        self.entry.key()
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        self.entry.buffer().read(dst, offset)
    }

    /// Copy `src` into the buffer at `offset`, marking touched pages
    /// dirty.
    pub fn write(&self, src: &[u8], offset: usize) -> Result<()> {
        self.entry.buffer_mut().write(src, offset)
    }

    /// Append `src` at the current used offset.
    pub fn append(&self, src: &[u8]) -> Result<()> {
        self.entry.buffer_mut().append(src)
    }

    /// Zero-copy read view of the used region.
    ///
    /// Holds the buffer's shared lock for the view's lifetime; drop it
    /// before any mutating call.
    pub fn memory(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.entry.buffer(), |b| b.used_memory())
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.entry.buffer().used()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entry.buffer().capacity()
    }

    #[inline]
    pub fn epoch(&self) -> u32 {
        self.entry.buffer().epoch()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.entry.is_dirty()
    }

    // ========================================================================
    // Encoded appends
    // ========================================================================

    /// Bind a fixed-width encoder to this buffer.
    ///
    /// A no-op if an encoder with the same spec is already bound.
    pub fn set_encoding(&self, spec: EncodingSpec) {
        let mut slot = self.entry.encoder_slot();
        match slot.as_ref() {
            Some(enc) if enc.spec() == spec => {}
            _ => *slot = Some(new_encoder(spec)),
        }
    }

    /// Narrow and append `num_elems` logical values from the front of
    /// `src`, advancing `src` past the consumed bytes.
    ///
    /// Returns the chunk metadata reflecting the append.
    ///
    /// # Errors
    /// - `Error::EncoderMissing` if no encoder is bound
    /// - `Error::EncodingOverflow` if a value does not fit the physical
    ///   type; nothing is appended
    /// - `Error::CapacityExceeded` if the buffer cannot hold the encoded
    ///   bytes
    pub fn append_encoded(&self, src: &mut &[u8], num_elems: usize) -> Result<ChunkMetadata> {
        // Lock order: buffer before encoder, matching the checkpoint
        // path.
        let mut buf = self.entry.buffer_mut();
        let mut slot = self.entry.encoder_slot();
        let encoder = slot.as_mut().ok_or(Error::EncoderMissing)?;
        encoder.append_data(&mut buf, src, num_elems)
    }

    /// Statistics snapshot of the bound encoder, if any.
    pub fn metadata(&self) -> Option<ChunkMetadata> {
        self.entry.encoder_slot().as_ref().map(|e| e.metadata())
    }

    /// Encoding spec plus statistics of the bound encoder, if any.
    ///
    /// Used by cross-level copies to carry statistics alongside bytes.
    pub fn encoder_snapshot(&self) -> Option<(EncodingSpec, ChunkMetadata)> {
        self.entry
            .encoder_slot()
            .as_ref()
            .map(|e| (e.spec(), e.metadata()))
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        self.entry.unpin();
    }
}

impl std::fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("entry", &*self.entry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;

    fn pinned() -> PinnedBuffer {
        let entry = Arc::new(BufferEntry::new(
            Buffer::new(4, 64, 0),
            MemoryLevel::Cpu,
            DeviceId::HOST,
            None,
            1,
        ));
        entry.pin();
        PinnedBuffer::adopt(entry)
    }

    #[test]
    fn test_drop_releases_pin() {
        let pb = pinned();
        let entry = Arc::clone(pb.entry());
        assert_eq!(entry.pin_count(), 1);
        drop(pb);
        assert_eq!(entry.pin_count(), 0);
    }

    #[test]
    fn test_append_and_memory_view() {
        let pb = pinned();
        pb.append(&[1, 2, 3, 4]).unwrap();
        assert_eq!(&*pb.memory(), &[1, 2, 3, 4]);
        assert_eq!(pb.used(), 4);
    }

    #[test]
    fn test_append_encoded_requires_encoder() {
        let pb = pinned();
        let data = 5i64.to_ne_bytes();
        let mut src: &[u8] = &data;
        let err = pb.append_encoded(&mut src, 1).unwrap_err();
        assert!(matches!(err, Error::EncoderMissing));
    }

    #[test]
    fn test_append_encoded_with_bound_encoder() {
        let pb = pinned();
        pb.set_encoding(EncodingSpec::I32ToI16);

        let values: Vec<u8> = [1i32, 2, 3].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut src: &[u8] = &values;
        let md = pb.append_encoded(&mut src, 3).unwrap();

        assert!(src.is_empty());
        assert_eq!(md.num_elements, 3);
        assert_eq!(pb.used(), 3 * std::mem::size_of::<i16>());
        assert_eq!(pb.metadata().unwrap(), md);
    }

    #[test]
    fn test_set_encoding_is_idempotent() {
        let pb = pinned();
        pb.set_encoding(EncodingSpec::I32ToI16);
        let values: Vec<u8> = 7i32.to_ne_bytes().to_vec();
        let mut src: &[u8] = &values;
        pb.append_encoded(&mut src, 1).unwrap();

        // Re-binding the same spec keeps the accumulated statistics.
        pb.set_encoding(EncodingSpec::I32ToI16);
        assert_eq!(pb.metadata().unwrap().num_elements, 1);
    }
}
