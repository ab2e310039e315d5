use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::error::{VfsError, VfsResult};
use crate::models::FileKey;

const CHUNK_EXT: &str = "bin";
const TMP_SUFFIX: &str = ".tmp";

/// Physical chunk storage: one directory per cached file, one file per
/// chunk, `<cache_root>/<container_hash>_<file_id>/<chunk_index:05>.bin`.
///
/// Size accounting is kept in memory and only changes on a successful
/// rename or unlink, so a cancelled write can never skew it.
pub struct ChunkStore {
    root: PathBuf,
    total_bytes: AtomicU64,
    chunk_count: AtomicU64,
}

/// Result of the startup scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub file_count: u64,
    pub chunk_count: u64,
    pub total_bytes: u64,
    pub tmp_files_removed: u64,
}

/// A chunk as seen by the eviction pass.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: FileKey,
    pub index: u64,
    pub size: u64,
    pub last_access: SystemTime,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            total_bytes: AtomicU64::new(0),
            chunk_count: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::Relaxed)
    }

    fn file_dir(&self, key: &FileKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    fn chunk_path(&self, key: &FileKey, index: u64) -> PathBuf {
        self.file_dir(key).join(format!("{:05}.{}", index, CHUNK_EXT))
    }

    pub async fn has(&self, key: &FileKey, index: u64) -> bool {
        fs::try_exists(self.chunk_path(key, index))
            .await
            .unwrap_or(false)
    }

    /// Full-chunk read. Updates the chunk's access time so eviction
    /// ordering follows actual use.
    pub async fn read(&self, key: &FileKey, index: u64) -> VfsResult<Bytes> {
        let path = self.chunk_path(key, index);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VfsError::NotFound(format!("chunk {} of {}", index, key)));
            }
            Err(e) => return Err(VfsError::Fatal(e)),
        };
        touch(&path);
        Ok(Bytes::from(data))
    }

    /// Write a chunk through the temp-and-rename protocol. The chunk is
    /// not observable (and not accounted) until the rename succeeds.
    pub async fn write_atomic(&self, key: &FileKey, index: u64, data: &[u8]) -> VfsResult<()> {
        let final_path = self.chunk_path(key, index);
        let tmp_path = final_path.with_extension(format!("{}{}", CHUNK_EXT, TMP_SUFFIX));

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let result: std::io::Result<()> = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(VfsError::Fatal(e));
        }

        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(VfsError::Fatal(e));
        }

        self.total_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.chunk_count.fetch_add(1, Ordering::Relaxed);
        trace!("Wrote chunk {} of {} ({} bytes)", index, key, data.len());
        Ok(())
    }

    /// Unlink one chunk; returns the bytes removed. Removes the per-file
    /// directory if it became empty.
    pub async fn delete(&self, key: &FileKey, index: u64) -> VfsResult<u64> {
        let path = self.chunk_path(key, index);
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(VfsError::Fatal(e)),
        };
        fs::remove_file(&path).await?;
        self.total_bytes.fetch_sub(size, Ordering::Relaxed);
        self.chunk_count.fetch_sub(1, Ordering::Relaxed);

        // Best-effort: fails while the directory still has entries.
        let _ = fs::remove_dir(self.file_dir(key)).await;
        Ok(size)
    }

    /// Remove every chunk of a file along with its directory.
    pub async fn delete_all(&self, key: &FileKey) -> VfsResult<()> {
        let dir = self.file_dir(key);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(VfsError::Fatal(e)),
        };

        let mut removed_bytes = 0u64;
        let mut removed_chunks = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_chunk = path
                .extension()
                .map(|e| e == CHUNK_EXT)
                .unwrap_or(false);
            if let Ok(meta) = entry.metadata().await {
                if is_chunk {
                    removed_bytes += meta.len();
                    removed_chunks += 1;
                }
            }
            let _ = fs::remove_file(&path).await;
        }
        let _ = fs::remove_dir(&dir).await;

        self.total_bytes.fetch_sub(removed_bytes, Ordering::Relaxed);
        self.chunk_count.fetch_sub(removed_chunks, Ordering::Relaxed);
        debug!(
            "Invalidated {}: removed {} chunks, {} bytes",
            key, removed_chunks, removed_bytes
        );
        Ok(())
    }

    /// Rebuild the in-memory accounting from disk. Orphaned `.tmp`
    /// files from interrupted writes are deleted; they were never part
    /// of the accounting.
    pub async fn scan(&self) -> VfsResult<ScanReport> {
        fs::create_dir_all(&self.root).await?;

        let mut report = ScanReport {
            file_count: 0,
            chunk_count: 0,
            total_bytes: 0,
            tmp_files_removed: 0,
        };

        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(dir_entry) = dirs.next_entry().await? {
            let dir_path = dir_entry.path();
            if !dir_path.is_dir() {
                continue;
            }
            let Some(name) = dir_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if FileKey::parse_dir_name(name).is_none() {
                warn!("Ignoring unrecognised cache directory {:?}", dir_path);
                continue;
            }

            let mut saw_chunk = false;
            let mut chunks = fs::read_dir(&dir_path).await?;
            while let Some(entry) = chunks.next_entry().await? {
                let path = entry.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if name.ends_with(TMP_SUFFIX) {
                    let _ = fs::remove_file(&path).await;
                    report.tmp_files_removed += 1;
                    continue;
                }
                if path.extension().map(|e| e == CHUNK_EXT).unwrap_or(false) {
                    if let Ok(meta) = entry.metadata().await {
                        report.chunk_count += 1;
                        report.total_bytes += meta.len();
                        saw_chunk = true;
                    }
                }
            }
            if saw_chunk {
                report.file_count += 1;
            }
        }

        self.total_bytes.store(report.total_bytes, Ordering::Relaxed);
        self.chunk_count.store(report.chunk_count, Ordering::Relaxed);
        debug!(
            "Cache scan: {} files, {} chunks, {} bytes ({} stale tmp removed)",
            report.file_count, report.chunk_count, report.total_bytes, report.tmp_files_removed
        );
        Ok(report)
    }

    /// All chunks ordered by last access ascending (coldest first).
    pub async fn enumerate_for_eviction(&self) -> VfsResult<Vec<EvictionCandidate>> {
        let mut candidates = Vec::new();

        let mut dirs = match fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(candidates),
            Err(e) => return Err(VfsError::Fatal(e)),
        };
        while let Some(dir_entry) = dirs.next_entry().await? {
            let dir_path = dir_entry.path();
            let Some(key) = dir_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(FileKey::parse_dir_name)
            else {
                continue;
            };

            let Ok(mut chunks) = fs::read_dir(&dir_path).await else {
                continue;
            };
            while let Some(entry) = chunks.next_entry().await? {
                let path = entry.path();
                if !path.extension().map(|e| e == CHUNK_EXT).unwrap_or(false) {
                    continue;
                }
                let Some(index) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    continue;
                };
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                let last_access = meta
                    .modified()
                    .or_else(|_| meta.accessed())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                candidates.push(EvictionCandidate {
                    key: key.clone(),
                    index,
                    size: meta.len(),
                    last_access,
                });
            }
        }

        candidates.sort_by_key(|c| c.last_access);
        Ok(candidates)
    }
}

/// Best-effort mtime bump; eviction ordering degrades gracefully if the
/// platform refuses it.
fn touch(path: &Path) {
    let now = SystemTime::now();
    if let Ok(file) = std::fs::OpenOptions::new().append(true).open(path) {
        let _ = file.set_modified(now);
    }
}
