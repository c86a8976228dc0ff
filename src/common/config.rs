//! Configuration for the data manager and per-query memory owner.
//!
//! All tuning knobs are carried in an explicit [`DataMgrConfig`] threaded
//! through construction; nothing in the allocation paths consults global
//! state.

/// Size of a buffer page in bytes (4KB).
///
/// Matches the OS page size on most systems and the sector-aligned I/O
/// granularity of the page file.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Minimum granularity of a [`RowSetMemoryOwner`] arena allocation.
///
/// Every request is rounded up to this size so that result buffers handed
/// to different worker threads never share a cache line.
///
/// [`RowSetMemoryOwner`]: crate::rowset::RowSetMemoryOwner
pub const ARENA_MIN_ALLOC: usize = 256;

/// Default block size for the per-query bump arena (1MB).
pub const DEFAULT_ARENA_BLOCK_BYTES: usize = 1 << 20;

/// Configuration for a [`DataMgr`] and its level managers.
///
/// # Level chain
/// The manager chain is built from this struct: one disk manager, one CPU
/// manager with a `cpu_pool_bytes` budget, and `num_gpus` device managers
/// each with a `gpu_pool_bytes` budget.
///
/// [`DataMgr`]: crate::mgr::DataMgr
#[derive(Debug, Clone)]
pub struct DataMgrConfig {
    /// Page size used by every buffer and by the disk page file.
    pub page_size: usize,

    /// Byte budget of the CPU cache tier.
    pub cpu_pool_bytes: usize,

    /// Byte budget of each GPU cache tier.
    pub gpu_pool_bytes: usize,

    /// Number of GPU devices. Zero disables the GPU level entirely.
    pub num_gpus: usize,

    /// Smallest allocation a cache tier will carve for a buffer.
    pub min_slab_bytes: usize,

    /// Largest single buffer a cache tier will allocate.
    pub max_slab_bytes: usize,

    /// Block granularity of the per-query arena.
    pub arena_block_bytes: usize,
}

impl Default for DataMgrConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cpu_pool_bytes: 1 << 28, // 256MB
            gpu_pool_bytes: 1 << 27, // 128MB per device
            num_gpus: 0,
            min_slab_bytes: DEFAULT_PAGE_SIZE,
            max_slab_bytes: 1 << 26, // 64MB
            arena_block_bytes: DEFAULT_ARENA_BLOCK_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
        assert_eq!(DEFAULT_PAGE_SIZE, 4096);
    }

    #[test]
    fn test_default_config_is_consistent() {
        let config = DataMgrConfig::default();
        assert!(config.min_slab_bytes <= config.max_slab_bytes);
        assert!(config.min_slab_bytes >= config.page_size);
        assert!(config.cpu_pool_bytes >= config.max_slab_bytes);
        assert_eq!(config.num_gpus, 0);
    }

    #[test]
    fn test_arena_min_alloc_covers_cache_lines() {
        assert_eq!(ARENA_MIN_ALLOC % 64, 0);
    }
}
