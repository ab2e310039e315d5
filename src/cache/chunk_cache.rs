use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::chunk_store::ChunkStore;
use super::download::{ChunkSpec, Downloader};
use super::stats::{CacheStats, CacheStatsSnapshot};
use crate::config::CacheConfig;
use crate::error::{VfsError, VfsResult};
use crate::models::FileKey;
use crate::provider::RemoteProvider;
use crate::util::lock_unpoisoned;

/// How often the read path triggers eviction when the cache is below
/// the high-water mark.
const EVICTION_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Short-lived descriptor for a read; the cache holds no references to
/// namespace state beyond this.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub key: FileKey,
    pub size: u64,
    /// Current fetchable URL. May be stale; a stale URL surfaces as
    /// `fetch-failed` and the caller refreshes it.
    pub url: String,
}

struct Inflight {
    chunk: u64,
    token: CancellationToken,
    handle: JoinHandle<VfsResult<()>>,
}

struct FileState {
    /// Serialises all reads (and invalidation) on this file.
    read_lock: Mutex<()>,
    /// The current background (readahead) download, if any.
    inflight: Mutex<Option<Inflight>>,
}

impl FileState {
    fn new() -> Self {
        Self {
            read_lock: Mutex::new(()),
            inflight: Mutex::new(None),
        }
    }
}

/// Read-through chunk cache over a [`ChunkStore`] and a remote
/// provider's range requests.
pub struct ChunkCache {
    store: Arc<ChunkStore>,
    downloader: Arc<Downloader>,
    chunk_size: u64,
    max_cache_size: u64,
    readahead_trigger: u64,
    stats: Arc<CacheStats>,
    states: StdMutex<HashMap<FileKey, Arc<FileState>>>,
    eviction_lock: Mutex<()>,
    last_eviction: StdMutex<Option<Instant>>,
}

impl ChunkCache {
    pub fn new(
        provider: Arc<dyn RemoteProvider>,
        store: Arc<ChunkStore>,
        config: &CacheConfig,
    ) -> Self {
        let stats = Arc::new(CacheStats::default());
        let downloader = Arc::new(Downloader::new(
            provider,
            store.clone(),
            config.chunk_size,
            config.max_total_concurrent_downloads,
            config.max_retries,
            config.retry_base_delay(),
            stats.clone(),
        ));
        Self {
            store,
            downloader,
            chunk_size: config.chunk_size,
            max_cache_size: config.max_cache_size,
            readahead_trigger: config.readahead_trigger_position,
            stats,
            states: StdMutex::new(HashMap::new()),
            eviction_lock: Mutex::new(()),
            last_eviction: StdMutex::new(None),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn statistics(&self) -> CacheStatsSnapshot {
        self.stats
            .snapshot(self.store.total_bytes(), self.store.chunk_count())
    }

    fn state_for(&self, key: &FileKey) -> Arc<FileState> {
        let mut states = lock_unpoisoned(&self.states);
        states
            .entry(key.clone())
            .or_insert_with(|| Arc::new(FileState::new()))
            .clone()
    }

    fn chunk_len(&self, file_size: u64, index: u64) -> u64 {
        self.chunk_size.min(file_size - index * self.chunk_size)
    }

    /// Read exactly `min(length, file.size - offset)` bytes starting at
    /// `offset`, fetching missing chunks from the provider.
    pub async fn read(
        &self,
        file: &CachedFile,
        offset: u64,
        length: u64,
        token: &CancellationToken,
    ) -> VfsResult<Bytes> {
        if offset > file.size {
            return Err(VfsError::InvalidRange {
                offset,
                length,
                size: file.size,
            });
        }
        let length = length.min(file.size - offset);
        if length == 0 {
            return Ok(Bytes::new());
        }

        self.maybe_evict().await;

        let state = self.state_for(&file.key);
        let _guard = tokio::select! {
            guard = state.read_lock.lock() => guard,
            _ = token.cancelled() => return Err(VfsError::Cancelled),
        };

        let s = self.chunk_size;
        let start_chunk = offset / s;
        let end_chunk = (offset + length - 1) / s;
        let mut out = BytesMut::with_capacity(length as usize);

        for index in start_chunk..=end_chunk {
            let chunk_start = index * s;
            let chunk_len = self.chunk_len(file.size, index);
            let slice_start = offset.max(chunk_start) - chunk_start;
            let slice_end = (offset + length).min(chunk_start + chunk_len) - chunk_start;

            let was_present = self.store.has(&file.key, index).await;
            if !was_present {
                self.ensure_chunk(&state, file, index, token).await?;
            }
            let data = self.read_verified(&state, file, index, chunk_len, token).await?;

            let slice = data.slice(slice_start as usize..slice_end as usize);
            if was_present {
                self.stats.record_hit(slice.len() as u64);
            } else {
                self.stats.record_miss(slice.len() as u64);
            }
            out.extend_from_slice(&slice);
        }

        // Readahead when the read ends near the end of its last chunk.
        let end_pos_in_chunk = offset + length - end_chunk * s;
        if end_pos_in_chunk > s.saturating_sub(self.readahead_trigger) {
            let next = end_chunk + 1;
            if next * s < file.size {
                self.schedule_readahead(&state, file, next).await;
            }
        }

        Ok(out.freeze())
    }

    /// Read a chunk, re-fetching it once if its on-disk length does not
    /// match the expected length (an externally corrupted chunk).
    async fn read_verified(
        &self,
        state: &Arc<FileState>,
        file: &CachedFile,
        index: u64,
        expected_len: u64,
        token: &CancellationToken,
    ) -> VfsResult<Bytes> {
        let data = self.store.read(&file.key, index).await?;
        if data.len() as u64 == expected_len {
            return Ok(data);
        }
        warn!(
            "Chunk {} of {} has {} bytes, expected {}; re-fetching",
            index,
            file.key,
            data.len(),
            expected_len
        );
        self.store.delete(&file.key, index).await?;
        self.ensure_chunk(state, file, index, token).await?;
        let data = self.store.read(&file.key, index).await?;
        if data.len() as u64 != expected_len {
            return Err(VfsError::FetchFailed(format!(
                "chunk {} of {} still has wrong length after re-fetch",
                index, file.key
            )));
        }
        Ok(data)
    }

    /// Make a chunk present on disk, joining or preempting an in-flight
    /// readahead per the preemption rule, then downloading inline if it
    /// is still missing. Caller holds the per-file read mutex.
    async fn ensure_chunk(
        &self,
        state: &Arc<FileState>,
        file: &CachedFile,
        index: u64,
        token: &CancellationToken,
    ) -> VfsResult<()> {
        let existing = state.inflight.lock().await.take();
        if let Some(inflight) = existing {
            let Inflight {
                chunk,
                token: dl_token,
                mut handle,
            } = inflight;
            if chunk == index {
                // Same chunk: join the task and reuse its result.
                let joined = tokio::select! {
                    res = &mut handle => Some(res),
                    _ = token.cancelled() => None,
                };
                match joined {
                    Some(Ok(Ok(()))) => {}
                    // The readahead was cancelled or died; fall through
                    // and download inline.
                    Some(Ok(Err(VfsError::Cancelled))) | Some(Err(_)) => {}
                    Some(Ok(Err(e))) => return Err(e),
                    None => {
                        dl_token.cancel();
                        let _ = handle.await;
                        return Err(VfsError::Cancelled);
                    }
                }
            } else {
                // A reader seek redirects bandwidth immediately;
                // readahead is a hint, never a commitment.
                trace!(
                    "Preempting download of chunk {} of {} in favour of chunk {}",
                    chunk, file.key, index
                );
                dl_token.cancel();
                let _ = handle.await;
            }
        }

        if self.store.has(&file.key, index).await {
            return Ok(());
        }

        let spec = ChunkSpec {
            key: file.key.clone(),
            index,
            url: file.url.clone(),
            length: self.chunk_len(file.size, index),
        };
        self.downloader.fetch_chunk(&spec, token).await
    }

    /// Start a background download of `index` unless one is already in
    /// flight for this file or the chunk is already present.
    async fn schedule_readahead(&self, state: &Arc<FileState>, file: &CachedFile, index: u64) {
        let mut slot = state.inflight.lock().await;
        if slot.is_some() {
            return;
        }
        if self.store.has(&file.key, index).await {
            return;
        }

        let spec = ChunkSpec {
            key: file.key.clone(),
            index,
            url: file.url.clone(),
            length: self.chunk_len(file.size, index),
        };
        let token = CancellationToken::new();
        let dl_token = token.clone();
        let downloader = self.downloader.clone();
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            let result = downloader.fetch_chunk(&spec, &dl_token).await;
            if let Err(e) = &result {
                if !matches!(e, VfsError::Cancelled) {
                    debug!("Readahead of chunk {} of {} failed: {}", spec.index, spec.key, e);
                }
            }
            // Clear the slot unless a reader already took it to join.
            let mut slot = task_state.inflight.lock().await;
            if slot.as_ref().map(|i| i.chunk) == Some(spec.index) {
                *slot = None;
            }
            result
        });

        *slot = Some(Inflight {
            chunk: index,
            token,
            handle,
        });
        self.stats.record_readahead();
        trace!("Scheduled readahead of chunk {} of {}", index, file.key);
    }

    /// Cancel any in-flight download for the file, delete all its
    /// chunks and drop its in-memory state.
    pub async fn invalidate(&self, key: &FileKey) -> VfsResult<()> {
        let state = self.state_for(key);
        let _guard = state.read_lock.lock().await;

        if let Some(inflight) = state.inflight.lock().await.take() {
            inflight.token.cancel();
            let _ = inflight.handle.await;
        }

        self.store.delete_all(key).await?;
        lock_unpoisoned(&self.states).remove(key);
        Ok(())
    }

    /// Run the eviction procedure if the cache is at or above the
    /// high-water mark, or if the periodic check is due. Skips entirely
    /// when another task holds the eviction lock.
    async fn maybe_evict(&self) {
        let high = self.max_cache_size / 10 * 9;
        let full = self.store.total_bytes() >= high;
        if !full {
            let due = match *lock_unpoisoned(&self.last_eviction) {
                None => true,
                Some(at) => at.elapsed() >= EVICTION_PERIOD,
            };
            if !due {
                return;
            }
        }

        let Ok(_guard) = self.eviction_lock.try_lock() else {
            return;
        };
        *lock_unpoisoned(&self.last_eviction) = Some(Instant::now());

        if self.store.total_bytes() < high {
            return;
        }
        let target = self.max_cache_size / 10 * 7;
        let candidates = match self.store.enumerate_for_eviction().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Eviction enumeration failed: {}", e);
                return;
            }
        };

        let before = self.store.total_bytes();
        for candidate in candidates {
            if self.store.total_bytes() <= target {
                break;
            }
            // A file whose per-file mutex is held has an active reader;
            // leave its chunks alone.
            let busy = {
                let states = lock_unpoisoned(&self.states);
                states
                    .get(&candidate.key)
                    .map(|s| s.read_lock.try_lock().is_err())
                    .unwrap_or(false)
            };
            if busy {
                continue;
            }
            match self.store.delete(&candidate.key, candidate.index).await {
                Ok(bytes) if bytes > 0 => self.stats.record_eviction(bytes),
                Ok(_) => {}
                Err(e) => warn!(
                    "Failed to evict chunk {} of {}: {}",
                    candidate.index, candidate.key, e
                ),
            }
        }
        debug!(
            "Eviction pass: {} -> {} bytes (target {})",
            before,
            self.store.total_bytes(),
            target
        );
    }
}
