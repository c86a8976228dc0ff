//! Buffer - a page-structured memory region holding one chunk's bytes.

use crate::buffer::Page;
use crate::common::{Error, Result};

/// A contiguous run of pages representing one physical allocation at one
/// memory level.
///
/// # Invariants
/// - `used <= capacity` at all times.
/// - The buffer dirty flag is true iff at least one page dirty flag is.
/// - `append` only advances `used`; capacity is fixed at construction and
///   callers must pre-size.
/// - Page dirty flags are cleared only by
///   [`clear_dirty_and_advance_epoch`], called by the owning level
///   manager once the bytes have been persisted downward.
///
/// `Buffer` is deliberately not `Clone`: its identity is tied to one
/// allocation at one level. Duplication goes through an explicit
/// cross-level copy that allocates a new buffer and transfers bytes.
///
/// [`clear_dirty_and_advance_epoch`]: Buffer::clear_dirty_and_advance_epoch
#[derive(Debug)]
pub struct Buffer {
    /// Backing region; length is the fixed capacity.
    data: Vec<u8>,
    /// Bytes appended/written so far.
    used: usize,
    /// Size of each page in bytes.
    page_size: usize,
    /// Version counter, advanced at every checkpoint of this buffer.
    epoch: u32,
    /// True if any page was written since the last checkpoint.
    dirty: bool,
    /// Per-page dirty tracking.
    pages: Vec<Page>,
}

impl Buffer {
    /// Create a zeroed buffer of `num_pages * page_size` bytes.
    ///
    /// # Panics
    /// Panics if `page_size` is 0.
    pub fn new(num_pages: usize, page_size: usize, epoch: u32) -> Self {
        assert!(page_size > 0, "page_size must be > 0");
        let pages = (0..num_pages).map(|i| Page::new(i * page_size)).collect();
        Self {
            data: vec![0u8; num_pages * page_size],
            used: 0,
            page_size,
            epoch,
            dirty: false,
            pages,
        }
    }

    /// Create a buffer with at least `capacity_bytes` of room, rounded up
    /// to whole pages.
    pub fn with_capacity(capacity_bytes: usize, page_size: usize, epoch: u32) -> Self {
        let num_pages = capacity_bytes.div_ceil(page_size).max(1);
        Self::new(num_pages, page_size, epoch)
    }

    // ========================================================================
    // Data access
    // ========================================================================

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Errors
    /// `Error::ReadPastUsed` if the range extends past the used size.
    pub fn read(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        let nbytes = dst.len();
        if offset + nbytes > self.used {
            return Err(Error::ReadPastUsed {
                offset,
                nbytes,
                used: self.used,
            });
        }
        dst.copy_from_slice(&self.data[offset..offset + nbytes]);
        Ok(())
    }

    /// Copy `src` into the buffer at `offset`, marking every touched page
    /// dirty and extending `used` if the write lands past it.
    ///
    /// # Errors
    /// `Error::CapacityExceeded` if the range extends past capacity; the
    /// buffer is left unmodified.
    pub fn write(&mut self, src: &[u8], offset: usize) -> Result<()> {
        let nbytes = src.len();
        if offset + nbytes > self.data.len() {
            return Err(Error::CapacityExceeded {
                offset,
                nbytes,
                capacity: self.data.len(),
            });
        }
        if nbytes == 0 {
            return Ok(());
        }
        self.data[offset..offset + nbytes].copy_from_slice(src);

        let first_page = offset / self.page_size;
        let last_page = (offset + nbytes - 1) / self.page_size;
        for page in &mut self.pages[first_page..=last_page] {
            page.mark_dirty();
        }
        self.dirty = true;
        self.used = self.used.max(offset + nbytes);
        Ok(())
    }

    /// Append `src` at the current used offset.
    ///
    /// # Errors
    /// `Error::CapacityExceeded` if the append would exceed capacity;
    /// nothing is appended.
    pub fn append(&mut self, src: &[u8]) -> Result<()> {
        self.write(src, self.used)
    }

    /// Read-only view of the used portion of the backing memory.
    ///
    /// The view is only valid for the caller's current operation: any
    /// mutating call may change its contents.
    #[inline]
    pub fn used_memory(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Read-only view of the whole backing region.
    #[inline]
    pub fn memory(&self) -> &[u8] {
        &self.data
    }

    /// One page's bytes.
    ///
    /// # Panics
    /// Panics if `page_index` is out of range.
    pub fn page_memory(&self, page_index: usize) -> &[u8] {
        let start = page_index * self.page_size;
        &self.data[start..start + self.page_size]
    }

    /// Overwrite one page's bytes without touching dirty state.
    ///
    /// Used when rematerializing a chunk from durable storage.
    pub(crate) fn load_page(&mut self, page_index: usize, src: &[u8]) {
        let start = page_index * self.page_size;
        let nbytes = src.len().min(self.page_size);
        self.data[start..start + nbytes].copy_from_slice(&src[..nbytes]);
    }

    // ========================================================================
    // State queries
    // ========================================================================

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// One page's metadata.
    pub fn page(&self, page_index: usize) -> &Page {
        &self.pages[page_index]
    }

    /// Indices of all dirty pages, in order.
    pub fn dirty_page_indices(&self) -> Vec<usize> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_dirty())
            .map(|(i, _)| i)
            .collect()
    }

    // ========================================================================
    // Checkpoint and copy hooks (level managers only)
    // ========================================================================

    /// Clear every dirty flag and advance the epoch.
    ///
    /// Called only once the dirty pages have been durably persisted to
    /// the level below.
    pub(crate) fn clear_dirty_and_advance_epoch(&mut self) {
        for page in &mut self.pages {
            page.clear_dirty();
        }
        self.dirty = false;
        self.epoch += 1;
    }

    /// Clear dirty flags without advancing the epoch.
    ///
    /// Used when a buffer is materialized from a clean source copy.
    pub(crate) fn force_clean(&mut self) {
        for page in &mut self.pages {
            page.clear_dirty();
        }
        self.dirty = false;
    }

    pub(crate) fn set_used(&mut self, used: usize) {
        debug_assert!(used <= self.data.len());
        self.used = used;
    }

    pub(crate) fn set_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_clean_and_empty() {
        let buf = Buffer::new(4, 64, 0);
        assert_eq!(buf.capacity(), 256);
        assert_eq!(buf.used(), 0);
        assert_eq!(buf.page_count(), 4);
        assert_eq!(buf.epoch(), 0);
        assert!(!buf.is_dirty());
        assert!(buf.dirty_page_indices().is_empty());
    }

    #[test]
    fn test_with_capacity_rounds_to_pages() {
        let buf = Buffer::with_capacity(100, 64, 0);
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.page_count(), 2);

        let buf = Buffer::with_capacity(0, 64, 0);
        assert_eq!(buf.page_count(), 1);
    }

    #[test]
    fn test_append_advances_used() {
        let mut buf = Buffer::new(2, 64, 0);
        buf.append(&[1, 2, 3]).unwrap();
        buf.append(&[4, 5]).unwrap();
        assert_eq!(buf.used(), 5);
        assert_eq!(buf.used_memory(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_read_back_appended_bytes() {
        let mut buf = Buffer::new(2, 64, 0);
        buf.append(b"hello world").unwrap();

        let mut dst = [0u8; 5];
        buf.read(&mut dst, 6).unwrap();
        assert_eq!(&dst, b"world");
    }

    #[test]
    fn test_read_past_used_fails() {
        let mut buf = Buffer::new(2, 64, 0);
        buf.append(&[1, 2, 3]).unwrap();

        let mut dst = [0u8; 4];
        let err = buf.read(&mut dst, 0).unwrap_err();
        assert!(matches!(err, Error::ReadPastUsed { used: 3, .. }));
    }

    #[test]
    fn test_append_past_capacity_fails() {
        let mut buf = Buffer::new(1, 8, 0);
        buf.append(&[0u8; 6]).unwrap();
        let err = buf.append(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { capacity: 8, .. }));
        // Nothing was appended.
        assert_eq!(buf.used(), 6);
    }

    #[test]
    fn test_write_marks_touched_pages_dirty() {
        let mut buf = Buffer::new(4, 64, 0);
        // Spans pages 1 and 2.
        buf.write(&[0xAB; 80], 60).unwrap();

        assert!(buf.is_dirty());
        assert_eq!(buf.dirty_page_indices(), vec![0, 1, 2]);
        assert!(!buf.page(3).is_dirty());
        assert_eq!(buf.used(), 140);
    }

    #[test]
    fn test_dirty_iff_any_page_dirty() {
        let mut buf = Buffer::new(4, 64, 0);
        assert_eq!(buf.is_dirty(), !buf.dirty_page_indices().is_empty());

        buf.write(&[1], 200).unwrap();
        assert_eq!(buf.is_dirty(), !buf.dirty_page_indices().is_empty());

        buf.clear_dirty_and_advance_epoch();
        assert_eq!(buf.is_dirty(), !buf.dirty_page_indices().is_empty());
    }

    #[test]
    fn test_checkpoint_clears_dirty_and_bumps_epoch() {
        let mut buf = Buffer::new(2, 64, 7);
        buf.append(&[1, 2, 3]).unwrap();
        assert!(buf.is_dirty());

        buf.clear_dirty_and_advance_epoch();
        assert!(!buf.is_dirty());
        assert!(buf.dirty_page_indices().is_empty());
        assert_eq!(buf.epoch(), 8);
        // Contents survive the checkpoint.
        assert_eq!(buf.used_memory(), &[1, 2, 3]);
    }

    #[test]
    fn test_write_extends_used_past_gap() {
        let mut buf = Buffer::new(2, 64, 0);
        buf.write(&[9, 9], 100).unwrap();
        assert_eq!(buf.used(), 102);
        // The gap reads back as zeros.
        let mut dst = [1u8; 4];
        buf.read(&mut dst, 0).unwrap();
        assert_eq!(dst, [0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_write_is_noop() {
        let mut buf = Buffer::new(1, 64, 0);
        buf.write(&[], 0).unwrap();
        assert!(!buf.is_dirty());
        assert_eq!(buf.used(), 0);
    }
}
