use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{CachedFile, ChunkCache};
use crate::error::{VfsError, VfsResult};
use crate::models::FileKey;
use crate::util::lock_unpoisoned;
use crate::vfs::{DirEntry, FileRef, FoundNode, NamespaceEvent, NodeKind, VirtualNamespace, path};

const LOOKUP_CACHE_CAPACITY: usize = 4096;

/// Resolves a virtual file reference to a readable descriptor. The
/// engine implements this over the registry and the provider: it
/// restores dormant containers and re-unrestricts stale links.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Current descriptor for the file, restoring its container first
    /// if it is dormant.
    async fn resolve(&self, key: &FileKey) -> VfsResult<CachedFile>;

    /// Force a fresh download URL after a `fetch-failed`.
    async fn refresh(&self, key: &FileKey) -> VfsResult<CachedFile>;
}

/// Uniform, permissive security descriptor reported for every merged
/// node.
#[derive(Debug, Clone, Copy)]
pub struct NodeSecurity {
    pub owner_is_system: bool,
    pub world_read: bool,
    pub world_traverse: bool,
    pub world_write: bool,
    pub world_delete: bool,
    pub deny_permission_change: bool,
    pub deny_take_ownership: bool,
}

impl NodeSecurity {
    pub const fn uniform() -> Self {
        Self {
            owner_is_system: true,
            world_read: true,
            world_traverse: true,
            world_write: true,
            world_delete: true,
            deny_permission_change: true,
            deny_take_ownership: true,
        }
    }
}

/// What the mount is told about the volume.
#[derive(Debug, Clone, Copy)]
pub struct VolumeInfo {
    pub case_sensitive: bool,
    pub case_preserving: bool,
}

impl VolumeInfo {
    pub const fn reported() -> Self {
        Self {
            case_sensitive: false,
            case_preserving: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResolvedNode {
    LocalFile { path: PathBuf, size: u64 },
    VirtualFile { path: String, file: FileRef },
    Directory { path: String },
}

#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub kind: NodeKind,
    pub size: u64,
    pub is_virtual: bool,
}

/// Overlay of a read/write local directory over the virtual namespace.
/// Local entries shadow virtual entries of the same name; writes only
/// ever touch the local side.
pub struct MergedView {
    namespace: Arc<VirtualNamespace>,
    cache: Arc<ChunkCache>,
    resolver: Arc<dyn LinkResolver>,
    local_root: PathBuf,
    lookup_cache: StdMutex<LruCache<String, Option<FoundNode>>>,
}

impl MergedView {
    pub fn new(
        namespace: Arc<VirtualNamespace>,
        cache: Arc<ChunkCache>,
        resolver: Arc<dyn LinkResolver>,
        local_root: PathBuf,
    ) -> Arc<Self> {
        let view = Arc::new(Self {
            namespace: namespace.clone(),
            cache,
            resolver,
            local_root,
            lookup_cache: StdMutex::new(LruCache::new(
                NonZeroUsize::new(LOOKUP_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
        });
        let weak = Arc::downgrade(&view);
        namespace.subscribe(move |event| {
            if let Some(view) = weak.upgrade() {
                view.invalidate_for(event);
            }
        });
        view
    }

    pub fn security(&self) -> NodeSecurity {
        NodeSecurity::uniform()
    }

    pub fn volume_info(&self) -> VolumeInfo {
        VolumeInfo::reported()
    }

    /// Drop memoised lookups touched by a namespace event; folder
    /// events invalidate their whole subtree.
    fn invalidate_for(&self, event: &NamespaceEvent) {
        let mut cache = lock_unpoisoned(&self.lookup_cache);
        match event {
            NamespaceEvent::FileAdded { path }
            | NamespaceEvent::FileDeleted { path } => {
                cache.pop(&path::fold(path));
                if let Some(parent) = path::parent(path) {
                    cache.pop(&path::fold(parent));
                }
            }
            NamespaceEvent::FileMoved { old, new } => {
                cache.pop(&path::fold(old));
                cache.pop(&path::fold(new));
            }
            NamespaceEvent::FolderAdded { path }
            | NamespaceEvent::FolderDeleted { path }
            | NamespaceEvent::FolderMoved { old: path, .. } => {
                let keys: Vec<String> = cache
                    .iter()
                    .map(|(key, _)| key.clone())
                    .filter(|key| path::starts_with_ci(key, path))
                    .collect();
                for key in keys {
                    cache.pop(&key);
                }
                if let NamespaceEvent::FolderMoved { new, .. } = event {
                    cache.pop(&path::fold(new));
                }
            }
        }
    }

    fn cached_find(&self, canonical: &str) -> Option<FoundNode> {
        let key = path::fold(canonical);
        {
            let mut cache = lock_unpoisoned(&self.lookup_cache);
            if let Some(found) = cache.get(&key) {
                return found.clone();
            }
        }
        let found = self.namespace.find(canonical);
        lock_unpoisoned(&self.lookup_cache).put(key, found.clone());
        found
    }

    /// Map a canonical merged path to its location under the local
    /// overlay directory.
    fn local_path_for(&self, canonical: &str) -> PathBuf {
        let mut local = self.local_root.clone();
        for segment in path::segments(canonical) {
            local.push(segment);
        }
        local
    }

    pub async fn resolve(&self, raw_path: &str) -> VfsResult<ResolvedNode> {
        let canonical = path::canonicalize(raw_path);
        let local = self.local_path_for(&canonical);

        if let Ok(meta) = fs::metadata(&local).await {
            if meta.is_file() {
                return Ok(ResolvedNode::LocalFile {
                    path: local,
                    size: meta.len(),
                });
            }
            return Ok(ResolvedNode::Directory { path: canonical });
        }

        match self.cached_find(&canonical) {
            Some(FoundNode::File { path, file }) => Ok(ResolvedNode::VirtualFile { path, file }),
            Some(FoundNode::Folder { path }) => Ok(ResolvedNode::Directory { path }),
            None => Err(VfsError::NotFound(canonical)),
        }
    }

    pub async fn metadata(&self, raw_path: &str) -> VfsResult<NodeMeta> {
        match self.resolve(raw_path).await? {
            ResolvedNode::LocalFile { size, .. } => Ok(NodeMeta {
                kind: NodeKind::File,
                size,
                is_virtual: false,
            }),
            ResolvedNode::VirtualFile { file, .. } => Ok(NodeMeta {
                kind: NodeKind::File,
                size: file.size,
                is_virtual: true,
            }),
            ResolvedNode::Directory { path } => {
                let is_virtual = !fs::try_exists(self.local_path_for(&path))
                    .await
                    .unwrap_or(false);
                Ok(NodeMeta {
                    kind: NodeKind::Folder,
                    size: 0,
                    is_virtual,
                })
            }
        }
    }

    /// Case-insensitive union of the local directory and the virtual
    /// folder; local entries shadow virtual entries of the same name.
    pub async fn list(&self, raw_path: &str) -> VfsResult<Vec<DirEntry>> {
        let canonical = path::canonicalize(raw_path);
        let local = self.local_path_for(&canonical);

        let virtual_entries = self.namespace.list(&canonical);
        let mut local_entries = Vec::new();
        let mut local_exists = false;
        match fs::read_dir(&local).await {
            Ok(mut entries) => {
                local_exists = true;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let meta = entry.metadata().await?;
                    local_entries.push(DirEntry {
                        name,
                        kind: if meta.is_dir() {
                            NodeKind::Folder
                        } else {
                            NodeKind::File
                        },
                        size: if meta.is_dir() { 0 } else { meta.len() },
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => {
                return Err(VfsError::NotAFile(canonical));
            }
            Err(e) => return Err(VfsError::Fatal(e)),
        }

        if !local_exists && virtual_entries.is_none() {
            return match self.cached_find(&canonical) {
                Some(FoundNode::File { .. }) => Err(VfsError::NotAFile(canonical)),
                _ => Err(VfsError::NotFound(canonical)),
            };
        }

        let mut merged: BTreeMap<String, DirEntry> = BTreeMap::new();
        for entry in virtual_entries.into_iter().flatten() {
            merged.insert(path::fold(&entry.name), entry);
        }
        for entry in local_entries {
            merged.insert(path::fold(&entry.name), entry);
        }
        Ok(merged.into_values().collect())
    }

    /// Read bytes at an offset. Virtual files go through the chunk
    /// cache; a stale download URL gets one refresh-and-retry.
    pub async fn read(
        &self,
        raw_path: &str,
        offset: u64,
        length: u64,
        token: &CancellationToken,
    ) -> VfsResult<Bytes> {
        match self.resolve(raw_path).await? {
            ResolvedNode::LocalFile { path, .. } => read_local(&path, offset, length).await,
            ResolvedNode::VirtualFile { file, path } => {
                let descriptor = self.resolver.resolve(&file.key).await?;
                match self.cache.read(&descriptor, offset, length, token).await {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.is_refreshable() => {
                        debug!("Read of {} hit a stale URL, refreshing: {}", path, e);
                        let descriptor = self.resolver.refresh(&file.key).await?;
                        self.cache.read(&descriptor, offset, length, token).await
                    }
                    Err(e) => Err(e),
                }
            }
            ResolvedNode::Directory { path } => Err(VfsError::NotAFile(path)),
        }
    }

    /// Create an empty local file. Fails if anything already resolves
    /// at the path.
    pub async fn create_file(&self, raw_path: &str) -> VfsResult<PathBuf> {
        let canonical = path::canonicalize(raw_path);
        if self.resolve(&canonical).await.is_ok() {
            return Err(VfsError::NameCollision(canonical));
        }
        let local = self.local_path_for(&canonical);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::File::create(&local).await?;
        trace!("Created local file {}", canonical);
        Ok(local)
    }

    /// Create a directory on the local side. The virtual hierarchy is
    /// only ever created by reconciliation.
    pub async fn mkdir(&self, raw_path: &str) -> VfsResult<()> {
        let canonical = path::canonicalize(raw_path);
        if self.resolve(&canonical).await.is_ok() {
            return Err(VfsError::NameCollision(canonical));
        }
        fs::create_dir_all(self.local_path_for(&canonical)).await?;
        Ok(())
    }

    /// Write to a local file. Virtual files are read-only.
    pub async fn write(&self, raw_path: &str, offset: u64, data: &[u8]) -> VfsResult<()> {
        match self.resolve(raw_path).await? {
            ResolvedNode::LocalFile { path, .. } => {
                let mut file = fs::OpenOptions::new().write(true).open(&path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(data).await?;
                Ok(())
            }
            ResolvedNode::VirtualFile { path, .. } => Err(VfsError::ReadOnly(path)),
            ResolvedNode::Directory { path } => Err(VfsError::NotAFile(path)),
        }
    }

    /// Delete a file or an empty directory. Virtual file deletion
    /// marks the file deleted in the namespace; the container keeps
    /// its metadata.
    pub async fn delete(&self, raw_path: &str) -> VfsResult<()> {
        match self.resolve(raw_path).await? {
            ResolvedNode::LocalFile { path, .. } => {
                fs::remove_file(&path).await?;
                Ok(())
            }
            ResolvedNode::VirtualFile { path, .. } => {
                let removed = self.namespace.delete_file(&path)?;
                if let Err(e) = self.cache.invalidate(&removed.key).await {
                    debug!("Cache invalidation after delete of {}: {}", path, e);
                }
                Ok(())
            }
            ResolvedNode::Directory { path } => {
                if !self.list(&path).await?.is_empty() {
                    return Err(VfsError::DirectoryNotEmpty(path));
                }
                let local = self.local_path_for(&path);
                if fs::try_exists(&local).await.unwrap_or(false) {
                    fs::remove_dir(&local).await?;
                }
                if self.namespace.folder_exists(&path) {
                    self.namespace.delete_folder(&path)?;
                }
                Ok(())
            }
        }
    }

    /// Rename within the merged view. Local nodes rename on disk;
    /// virtual nodes rename in the namespace (and persist through its
    /// events). A rename may not land on an existing node.
    pub async fn rename(&self, raw_src: &str, raw_dst: &str) -> VfsResult<()> {
        let src = path::canonicalize(raw_src);
        let dst = path::canonicalize(raw_dst);
        let source = self.resolve(&src).await?;

        let case_only_rename = path::eq_ci(&src, &dst) && src != dst;
        if !case_only_rename && self.resolve(&dst).await.is_ok() {
            return Err(VfsError::NameCollision(dst));
        }

        match source {
            ResolvedNode::LocalFile { path, .. } => {
                let target = self.local_path_for(&dst);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(&path, &target).await?;
                Ok(())
            }
            ResolvedNode::VirtualFile { path, .. } => {
                self.namespace.move_file(&path, &dst)?;
                Ok(())
            }
            ResolvedNode::Directory { path } => {
                let local = self.local_path_for(&path);
                if fs::try_exists(&local).await.unwrap_or(false) {
                    let target = self.local_path_for(&dst);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::rename(&local, &target).await?;
                }
                if self.namespace.folder_exists(&path) {
                    self.namespace.move_folder(&path, &dst)?;
                }
                Ok(())
            }
        }
    }
}

async fn read_local(path: &PathBuf, offset: u64, length: u64) -> VfsResult<Bytes> {
    let meta = fs::metadata(path).await?;
    let size = meta.len();
    if offset > size {
        return Err(VfsError::InvalidRange {
            offset,
            length,
            size,
        });
    }
    let length = length.min(size - offset);
    if length == 0 {
        return Ok(Bytes::new());
    }
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = BytesMut::zeroed(length as usize);
    file.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}
