use std::future::Future;

use dashmap::DashMap;
use time::OffsetDateTime;
use tracing::debug;

use super::stats::{CacheStats, CacheStatsSnapshot};
use crate::types::{CacheEntry, CacheKey, SearchOutcome};

/// Per-session memo of classification outcomes.
///
/// Entries never expire; the cache lives exactly as long as the composition
/// root that owns it and is never written to disk. Fallback outcomes are
/// stored like any other so a failing query does not hit the service again.
#[derive(Debug, Default)]
pub struct SessionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    stats: CacheStats,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<SearchOutcome> {
        let result = self.entries.get(key).map(|entry| entry.outcome.clone());
        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    /// Full entry including its creation time. Does not touch the stats.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    pub fn insert(&self, key: CacheKey, outcome: SearchOutcome) {
        let entry = CacheEntry {
            outcome,
            created_at: OffsetDateTime::now_utc(),
        };
        self.entries.insert(key, entry);
        self.stats.set_entry_count(self.entries.len());
    }

    /// Return the cached outcome for `(query, prioritize_videos)` or run
    /// `compute` and remember its result.
    ///
    /// An `Err` from `compute` (a cancelled computation) is passed through
    /// and nothing is stored.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        query: &str,
        prioritize_videos: bool,
        compute: F,
    ) -> Result<SearchOutcome, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SearchOutcome, E>>,
    {
        let key = CacheKey::new(query, prioritize_videos);
        if let Some(outcome) = self.get(&key) {
            debug!(
                target: "lookout_client",
                query = key.query(),
                prioritize_videos,
                "search outcome served from session cache"
            );
            return Ok(outcome);
        }

        let outcome = compute().await?;
        self.insert(key, outcome.clone());
        Ok(outcome)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry and starts the hit and miss counters over.
    pub fn clear(&self) {
        self.entries.clear();
        self.stats.reset();
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn outcome(query: &str, success: bool) -> SearchOutcome {
        SearchOutcome {
            success,
            results: Vec::new(),
            search_query: query.to_string(),
            error: None,
        }
    }

    #[tokio::test]
    async fn computes_once_per_normalized_key() {
        let cache = SessionCache::new();
        let calls = AtomicUsize::new(0);

        for query in ["Rust lifetimes", "  rust LIFETIMES  "] {
            let result: Result<_, ()> = cache
                .get_or_compute(query, true, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(outcome(query, true))
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn video_flag_is_part_of_the_key() {
        let cache = SessionCache::new();
        let calls = AtomicUsize::new(0);

        for flag in [true, false] {
            let _: Result<_, ()> = cache
                .get_or_compute("rust", flag, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(outcome("rust", true))
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failed_outcomes_are_cached_too() {
        let cache = SessionCache::new();
        let _: Result<_, ()> = cache
            .get_or_compute("flaky", false, || async { Ok(outcome("flaky", false)) })
            .await;

        let cached = cache.get(&CacheKey::new("flaky", false)).expect("cached");
        assert!(!cached.success);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = SessionCache::new();
        let result = cache
            .get_or_compute("cancelled", false, || async { Err::<SearchOutcome, _>("cancelled") })
            .await;

        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn clear_starts_stats_over() {
        let cache = SessionCache::new();
        cache.insert(CacheKey::new("a", false), outcome("a", true));
        cache.insert(CacheKey::new("b", false), outcome("b", true));
        assert!(cache.entry(&CacheKey::new("A ", false)).is_some());
        let _: Result<_, ()> = cache
            .get_or_compute("a", false, || async { Ok(outcome("a", true)) })
            .await;
        assert_eq!(cache.stats().hits, 1);

        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStatsSnapshot { hits: 0, misses: 0, entry_count: 0 });
    }
}
