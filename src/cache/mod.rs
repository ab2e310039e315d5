mod chunk_cache;
mod chunk_store;
mod download;
mod stats;

pub use chunk_cache::{CachedFile, ChunkCache};
pub use chunk_store::{ChunkStore, EvictionCandidate, ScanReport};
pub use download::{ChunkSpec, Downloader};
pub use stats::{CacheStats, CacheStatsSnapshot};
