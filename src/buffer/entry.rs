//! Buffer entry - the shared, lock-guarded shell around a [`Buffer`].

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::Buffer;
use crate::common::{ChunkKey, DeviceId, MemoryLevel};
use crate::encoder::Encoder;

/// One resident buffer at one memory level, shared between the level
/// manager that owns it and every pinned handle pointing at it.
///
/// # Thread Safety
/// - `buf`: `RwLock` — readers share, writers and checkpoint exclude
/// - `encoder`: `Mutex` — append-side statistics, rarely contended
/// - `pin_count`: `AtomicU32` — lock-free reference counting
///
/// The pin count is what makes cross-level promotion safe: a level
/// manager never evicts an entry whose pin count is non-zero, and the
/// manager pins an entry under its own allocation lock before handing it
/// out, so there is no window in which a caller can observe a buffer
/// that eviction may reclaim.
pub struct BufferEntry {
    /// The page-structured buffer itself.
    buf: RwLock<Buffer>,
    /// Encoder bound to this buffer for encoded appends, if any.
    encoder: Mutex<Option<Box<dyn Encoder>>>,
    /// Number of outstanding pinned handles.
    pin_count: AtomicU32,
    /// Level this allocation lives at.
    level: MemoryLevel,
    /// Device within the level.
    device: DeviceId,
    /// Chunk identity, or `None` for key-less transient buffers.
    key: Option<ChunkKey>,
    /// Manager-local id, used to address transient buffers.
    id: u64,
}

impl BufferEntry {
    pub(crate) fn new(
        buf: Buffer,
        level: MemoryLevel,
        device: DeviceId,
        key: Option<ChunkKey>,
        id: u64,
    ) -> Self {
        Self {
            buf: RwLock::new(buf),
            encoder: Mutex::new(None),
            pin_count: AtomicU32::new(0),
            level,
            device,
            key,
            id,
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    #[inline]
    pub fn level(&self) -> MemoryLevel {
        self.level
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn key(&self) -> Option<&ChunkKey> {
        self.key.as_ref()
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    // ========================================================================
    // Buffer access
    // ========================================================================

    /// Acquire a shared lock on the buffer.
    #[inline]
    pub fn buffer(&self) -> RwLockReadGuard<'_, Buffer> {
        self.buf.read()
    }

    /// Acquire an exclusive lock on the buffer.
    #[inline]
    pub(crate) fn buffer_mut(&self) -> RwLockWriteGuard<'_, Buffer> {
        self.buf.write()
    }

    /// Access the encoder slot.
    #[inline]
    pub(crate) fn encoder_slot(&self) -> MutexGuard<'_, Option<Box<dyn Encoder>>> {
        self.encoder.lock()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.buf.read().is_dirty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.read().capacity()
    }

    // ========================================================================
    // Pin counting
    // ========================================================================

    /// Increment the pin count. Returns the new count.
    #[inline]
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the pin count. Returns the new count.
    ///
    /// # Panics
    /// Panics if the pin count is already 0 — an unpin without a matching
    /// pin is a lifetime bug in the calling layer, and continuing with an
    /// inconsistent reference count is worse than aborting.
    #[inline]
    pub(crate) fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "pin count underflow");
        old - 1
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }
}

impl std::fmt::Debug for BufferEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferEntry")
            .field("level", &self.level)
            .field("device", &self.device)
            .field("key", &self.key)
            .field("id", &self.id)
            .field("pin_count", &self.pin_count())
            .finish()
    }
}
