use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cache statistics tracker using atomic counters for thread-safe operation.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered from the session cache
    pub hits: AtomicUsize,
    /// Lookups that had to reach the search service
    pub misses: AtomicUsize,
    /// Current number of cached outcomes
    pub entry_count: AtomicUsize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_entry_count(&self, count: usize) {
        self.entry_count.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entry_count.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.entry_count.store(0, Ordering::Relaxed);
    }
}

/// Immutable snapshot of cache statistics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    pub hits: usize,
    pub misses: usize,
    pub entry_count: usize,
}

impl CacheStatsSnapshot {
    /// Hit rate as a percentage (0.0 - 100.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        (self.hits as f64 / total as f64) * 100.0
    }

    pub fn total_requests(&self) -> usize {
        self.hits + self.misses
    }
}
