//! Cache tier statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked by a cache-tier buffer manager.
///
/// All fields are atomic for lock-free updates from concurrent chunk
/// requests; `Ordering::Relaxed` is enough because the counters are
/// independent and only eventually consistent totals matter.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Requests answered by a resident buffer.
    pub hits: AtomicU64,
    /// Requests that required materialization from a lower level.
    pub misses: AtomicU64,
    /// Buffers evicted to make room.
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy for display and assertions.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A non-atomic snapshot of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStatsSnapshot {
    /// Cache hit rate in `[0.0, 1.0]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, evictions: {}, hit_rate: {:.2}% }}",
            self.hits,
            self.misses,
            self.evictions,
            self.hit_rate() * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::new();
        stats.hits.fetch_add(7, Ordering::Relaxed);
        stats.misses.fetch_add(3, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 7);
        assert_eq!(snap.hit_rate(), 0.7);
    }

    #[test]
    fn test_empty_hit_rate_is_zero() {
        assert_eq!(CacheStats::new().snapshot().hit_rate(), 0.0);
    }

    #[test]
    fn test_display() {
        let stats = CacheStats::new();
        stats.hits.fetch_add(80, Ordering::Relaxed);
        stats.misses.fetch_add(20, Ordering::Relaxed);
        let s = format!("{}", stats.snapshot());
        assert!(s.contains("hits: 80"));
        assert!(s.contains("80.00%"));
    }
}
