use std::sync::atomic::{AtomicU64, Ordering};

/// Monotone cache counters, updated with relaxed atomic increments
/// outside any lock.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Chunk reads served from disk.
    pub hits: AtomicU64,
    /// Chunk reads that required a fetch.
    pub misses: AtomicU64,
    pub bytes_from_cache: AtomicU64,
    pub bytes_from_remote: AtomicU64,
    pub downloads_started: AtomicU64,
    pub downloads_completed: AtomicU64,
    pub downloads_cancelled: AtomicU64,
    pub downloads_failed: AtomicU64,
    pub readaheads_scheduled: AtomicU64,
    pub chunks_evicted: AtomicU64,
    pub bytes_evicted: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`] plus current store totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bytes_from_cache: u64,
    pub bytes_from_remote: u64,
    pub downloads_started: u64,
    pub downloads_completed: u64,
    pub downloads_cancelled: u64,
    pub downloads_failed: u64,
    pub readaheads_scheduled: u64,
    pub chunks_evicted: u64,
    pub bytes_evicted: u64,
    pub cache_size_bytes: u64,
    pub chunk_count: u64,
}

impl CacheStats {
    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_miss(&self, bytes: u64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.bytes_from_remote.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download_started(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_completed(&self) {
        self.downloads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_cancelled(&self) {
        self.downloads_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download_failed(&self) {
        self.downloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_readahead(&self) {
        self.readaheads_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, bytes: u64) {
        self.chunks_evicted.fetch_add(1, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache_size_bytes: u64, chunk_count: u64) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
            bytes_from_remote: self.bytes_from_remote.load(Ordering::Relaxed),
            downloads_started: self.downloads_started.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            downloads_cancelled: self.downloads_cancelled.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            readaheads_scheduled: self.readaheads_scheduled.load(Ordering::Relaxed),
            chunks_evicted: self.chunks_evicted.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            cache_size_bytes,
            chunk_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = CacheStats::default();
        stats.record_hit(100);
        stats.record_hit(50);
        stats.record_miss(8);
        stats.record_eviction(1024);

        let snap = stats.snapshot(2048, 2);
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.bytes_from_cache, 150);
        assert_eq!(snap.bytes_from_remote, 8);
        assert_eq!(snap.chunks_evicted, 1);
        assert_eq!(snap.bytes_evicted, 1024);
        assert_eq!(snap.cache_size_bytes, 2048);
        assert_eq!(snap.chunk_count, 2);
    }
}
