use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{
    Container, ContainerHash, FileEntry, FileId, FileKey, HostId, LifecycleState, RemoteStatus,
    TransferSample,
};
use crate::provider::{RemoteContainer, UnrestrictedLink};
use crate::store::{PersistedStore, StoreCategory};
use crate::vfs::{FileRef, NamespaceEvent, VirtualNamespace, path};

/// How stale the persisted `last_accessed` may get before a read
/// forces a descriptor write.
const ACCESS_PERSIST_LAG_MINUTES: i64 = 10;

/// Outcome of folding an upstream observation into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    Created,
    StatusChanged {
        from: RemoteStatus,
        to: RemoteStatus,
    },
    Unchanged,
}

/// Everything the read path needs to know about one file, resolved
/// from the owning container.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub key: FileKey,
    pub host_id: HostId,
    pub size: u64,
    pub restricted_link: String,
    pub download_url: Option<String>,
    pub lifecycle: LifecycleState,
    pub deleted: bool,
}

struct Inner {
    by_hash: HashMap<ContainerHash, Container>,
    by_host: HashMap<HostId, ContainerHash>,
    /// When each container's `last_accessed` was last written to disk.
    access_flushed: HashMap<ContainerHash, chrono::DateTime<Utc>>,
}

/// In-memory owner of all [`Container`]s, keyed by hash. The namespace
/// holds lookup references only; every mutation flows through here and
/// is persisted immediately.
pub struct ContainerRegistry {
    inner: RwLock<Inner>,
    store: Arc<PersistedStore>,
}

impl ContainerRegistry {
    pub fn new(store: Arc<PersistedStore>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_hash: HashMap::new(),
                by_host: HashMap::new(),
                access_flushed: HashMap::new(),
            }),
            store,
        }
    }

    fn category_of(container: &Container) -> StoreCategory {
        if container.lifecycle_state == LifecycleState::Problematic {
            return StoreCategory::Problematic;
        }
        if !container.files.is_empty() && container.files.iter().all(|f| f.deleted_locally) {
            return StoreCategory::Deleted;
        }
        StoreCategory::Active
    }

    /// Load persisted containers and rebuild the namespace from every
    /// non-deleted file's `local_path`. Descriptors under `Deleted/`
    /// are history and stay on disk only.
    pub async fn load_from_store(&self, namespace: &VirtualNamespace) -> anyhow::Result<usize> {
        let loaded = self.store.load_all().await?;
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for (container, category) in loaded {
            if category == StoreCategory::Deleted {
                continue;
            }
            for file in &container.files {
                if file.deleted_locally || file.local_path.is_empty() {
                    continue;
                }
                let file_ref = FileRef {
                    key: container.file_key(file.file_id),
                    size: file.size,
                };
                if let Err(e) = namespace.restore_file(&file.local_path, file_ref) {
                    warn!(
                        "Could not restore {} into the namespace: {}",
                        file.local_path, e
                    );
                }
            }
            inner
                .by_host
                .insert(container.host_id.clone(), container.hash.clone());
            inner.by_hash.insert(container.hash.clone(), container);
            count += 1;
        }
        info!("Loaded {} containers from the store", count);
        Ok(count)
    }

    async fn persist_inner(&self, container: &Container) {
        let category = Self::category_of(container);
        if let Err(e) = self.store.save(container, category).await {
            warn!("Failed to persist container {}: {:#}", container.host_id, e);
        }
    }

    pub async fn persist(&self, hash: &ContainerHash) {
        let snapshot = {
            let inner = self.inner.read().await;
            inner.by_hash.get(hash).cloned()
        };
        if let Some(container) = snapshot {
            self.persist_inner(&container).await;
        }
    }

    /// Fold one upstream observation in. Creates the container on
    /// first sight; otherwise updates status, name and the transfer
    /// sample (keeping the stall markers). Persists on change.
    pub async fn upsert_remote(&self, remote: &RemoteContainer) -> RemoteChange {
        let status = RemoteStatus::from_upstream(&remote.status);
        let (change, snapshot) = {
            let mut inner = self.inner.write().await;
            match inner.by_hash.get_mut(&remote.hash) {
                Some(container) => {
                    let old_status = container.remote_status;
                    container.name = remote.name.clone();
                    container.remote_status = status;
                    let previous = container.transfer.unwrap_or_default();
                    container.transfer = Some(TransferSample {
                        bytes_done: remote.bytes_done,
                        speed_bps: remote.speed_bps,
                        seeders: remote.seeders,
                        slow_since: previous.slow_since,
                        seedless_since: previous.seedless_since,
                    });
                    if old_status != status {
                        (
                            RemoteChange::StatusChanged {
                                from: old_status,
                                to: status,
                            },
                            Some(container.clone()),
                        )
                    } else {
                        (RemoteChange::Unchanged, None)
                    }
                }
                None => {
                    let mut container = Container::new(
                        remote.host_id.clone(),
                        remote.hash.clone(),
                        remote.name.clone(),
                    );
                    container.remote_status = status;
                    if let Some(added_at) = remote.added_at {
                        container.added_at = added_at;
                    }
                    inner
                        .by_host
                        .insert(container.host_id.clone(), container.hash.clone());
                    let snapshot = container.clone();
                    inner.by_hash.insert(remote.hash.clone(), container);
                    (RemoteChange::Created, Some(snapshot))
                }
            }
        };
        if let Some(container) = snapshot {
            self.persist_inner(&container).await;
        }
        change
    }

    pub async fn get(&self, hash: &ContainerHash) -> Option<Container> {
        self.inner.read().await.by_hash.get(hash).cloned()
    }

    pub async fn get_by_host(&self, host_id: &HostId) -> Option<Container> {
        let inner = self.inner.read().await;
        let hash = inner.by_host.get(host_id)?;
        inner.by_hash.get(hash).cloned()
    }

    pub async fn all(&self) -> Vec<Container> {
        self.inner.read().await.by_hash.values().cloned().collect()
    }

    pub async fn insert(&self, container: Container) {
        {
            let mut inner = self.inner.write().await;
            inner
                .by_host
                .insert(container.host_id.clone(), container.hash.clone());
            inner
                .by_hash
                .insert(container.hash.clone(), container.clone());
        }
        self.persist_inner(&container).await;
    }

    pub async fn mark_problematic(
        &self,
        hash: &ContainerHash,
        reason: &str,
        details: Option<String>,
    ) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let Some(container) = inner.by_hash.get_mut(hash) else {
                return;
            };
            container.mark_problematic(reason, details);
            container.clone()
        };
        warn!("Container {} marked problematic: {}", hash, reason);
        self.persist_inner(&snapshot).await;
    }

    pub async fn set_lifecycle(&self, hash: &ContainerHash, state: LifecycleState) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let Some(container) = inner.by_hash.get_mut(hash) else {
                return;
            };
            container.lifecycle_state = state;
            if state != LifecycleState::Problematic {
                container.problem_reason = None;
                container.problem_details = None;
            }
            container.clone()
        };
        self.persist_inner(&snapshot).await;
    }

    /// Replace the container's file set after the completion pipeline
    /// resolved links, and record the new host id.
    pub async fn attach_files(
        &self,
        hash: &ContainerHash,
        host_id: Option<HostId>,
        files: Vec<FileEntry>,
    ) {
        let (replaced_host, snapshot) = {
            let mut inner = self.inner.write().await;
            let old_host = match inner.by_hash.get_mut(hash) {
                Some(container) => {
                    container.files = files;
                    host_id
                        .as_ref()
                        .map(|new| std::mem::replace(&mut container.host_id, new.clone()))
                }
                None => return,
            };
            if let (Some(old), Some(new)) = (&old_host, host_id) {
                inner.by_host.remove(old);
                inner.by_host.insert(new, hash.clone());
            }
            (old_host, inner.by_hash.get(hash).cloned())
        };
        if let Some(container) = snapshot {
            if let Some(old) = replaced_host {
                if old != container.host_id {
                    if let Err(e) = self.store.remove(&old).await {
                        warn!("Failed to drop stale descriptor {}: {:#}", old, e);
                    }
                }
            }
            self.persist_inner(&container).await;
        }
    }

    pub async fn set_category(&self, hash: &ContainerHash, category: Option<String>) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let Some(container) = inner.by_hash.get_mut(hash) else {
                return;
            };
            container.category = category;
            container.clone()
        };
        self.persist_inner(&snapshot).await;
    }

    /// Record per-link failures without changing the lifecycle.
    pub async fn set_problem_details(&self, hash: &ContainerHash, details: Option<String>) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let Some(container) = inner.by_hash.get_mut(hash) else {
                return;
            };
            container.problem_details = details;
            container.clone()
        };
        self.persist_inner(&snapshot).await;
    }

    /// After a dormant container was re-added upstream: take its new
    /// host id and refreshed links, keeping every file's `local_path`.
    pub async fn refresh_links(
        &self,
        hash: &ContainerHash,
        new_host: HostId,
        links: Vec<(FileId, String, UnrestrictedLink)>,
    ) {
        let (old_host, snapshot) = {
            let mut inner = self.inner.write().await;
            let old_host = match inner.by_hash.get_mut(hash) {
                Some(container) => {
                    let old = std::mem::replace(&mut container.host_id, new_host.clone());
                    for (file_id, restricted, unrestricted) in links {
                        if let Some(file) = container.file_mut(file_id) {
                            file.restricted_link = restricted;
                            file.host_id = unrestricted.host_id;
                            file.download_url = Some(unrestricted.download_url);
                        }
                    }
                    old
                }
                None => return,
            };
            inner.by_host.remove(&old_host);
            inner.by_host.insert(new_host, hash.clone());
            (old_host, inner.by_hash.get(hash).cloned())
        };
        if let Some(container) = snapshot {
            // The previous descriptor was filed under the old host id.
            if old_host != container.host_id {
                if let Err(e) = self.store.remove(&old_host).await {
                    warn!("Failed to drop stale descriptor {}: {:#}", old_host, e);
                }
            }
            self.persist_inner(&container).await;
        }
    }

    pub async fn update_file_url(&self, key: &FileKey, host_id: HostId, url: String) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let Some(container) = inner.by_hash.get_mut(&key.hash) else {
                return;
            };
            let Some(file) = container.file_mut(key.file_id) else {
                return;
            };
            file.host_id = host_id;
            file.download_url = Some(url);
            container.clone()
        };
        self.persist_inner(&snapshot).await;
    }

    pub async fn set_transfer(&self, hash: &ContainerHash, sample: TransferSample) {
        let mut inner = self.inner.write().await;
        if let Some(container) = inner.by_hash.get_mut(hash) {
            container.transfer = Some(sample);
        }
    }

    /// A verification succeeded: stamp the time and reset the
    /// consecutive-failure counter.
    pub async fn mark_verified(&self, hash: &ContainerHash) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let Some(container) = inner.by_hash.get_mut(hash) else {
                return;
            };
            container.last_verified = Some(Utc::now());
            container.verification_attempts = 0;
            container.clone()
        };
        self.persist_inner(&snapshot).await;
    }

    /// A verification attempt failed: stamp the time and bump the
    /// consecutive-failure counter. Returns the new count.
    pub async fn mark_verification_failed(&self, hash: &ContainerHash) -> u32 {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let Some(container) = inner.by_hash.get_mut(hash) else {
                return 0;
            };
            container.last_verified = Some(Utc::now());
            container.verification_attempts += 1;
            container.clone()
        };
        let attempts = snapshot.verification_attempts;
        self.persist_inner(&snapshot).await;
        attempts
    }

    /// Record a read against a container. The persisted copy is only
    /// refreshed when it lags by more than a few minutes.
    pub async fn touch_access(&self, hash: &ContainerHash) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let now = Utc::now();
            let stale = match inner.access_flushed.get(hash) {
                None => true,
                Some(flushed) => now - *flushed > ChronoDuration::minutes(ACCESS_PERSIST_LAG_MINUTES),
            };
            let Some(container) = inner.by_hash.get_mut(hash) else {
                return;
            };
            container.last_accessed = Some(now);
            let snapshot = stale.then(|| container.clone());
            if stale {
                inner.access_flushed.insert(hash.clone(), now);
            }
            snapshot
        };
        if let Some(container) = snapshot {
            self.persist_inner(&container).await;
        }
    }

    pub async fn file_descriptor(&self, key: &FileKey) -> Option<FileDescriptor> {
        let inner = self.inner.read().await;
        let container = inner.by_hash.get(&key.hash)?;
        let file = container.file(key.file_id)?;
        Some(FileDescriptor {
            key: key.clone(),
            host_id: container.host_id.clone(),
            size: file.size,
            restricted_link: file.restricted_link.clone(),
            download_url: file.download_url.clone(),
            lifecycle: container.lifecycle_state,
            deleted: file.deleted_locally,
        })
    }

    /// Drop a container. With `purge` the descriptor is destroyed;
    /// otherwise it moves to `Deleted/` as history.
    pub async fn remove(&self, hash: &ContainerHash, purge: bool) -> Option<Container> {
        let removed = {
            let mut inner = self.inner.write().await;
            let container = inner.by_hash.remove(hash)?;
            inner.by_host.remove(&container.host_id);
            inner.access_flushed.remove(hash);
            container
        };
        if purge {
            if let Err(e) = self.store.remove(&removed.host_id).await {
                warn!("Failed to purge descriptor {}: {:#}", removed.host_id, e);
            }
        } else {
            let mut tombstone = removed.clone();
            for file in &mut tombstone.files {
                file.deleted_locally = true;
            }
            if let Err(e) = self.store.save(&tombstone, StoreCategory::Deleted).await {
                warn!("Failed to tombstone {}: {:#}", tombstone.host_id, e);
            }
        }
        Some(removed)
    }

    /// Reaction to an external `Active/` descriptor deletion: delete
    /// the container's files from the namespace; the resulting events
    /// mark them `deleted_locally` and re-persist as a tombstone.
    pub async fn apply_external_deletion(
        &self,
        host_id: &HostId,
        namespace: &VirtualNamespace,
    ) {
        let Some(container) = self.get_by_host(host_id).await else {
            return;
        };
        info!(
            "Descriptor for {} removed externally; dropping its files",
            host_id
        );
        for file in &container.files {
            if file.deleted_locally || file.local_path.is_empty() {
                continue;
            }
            if let Err(e) = namespace.delete_file(&file.local_path) {
                debug!("External delete of {}: {}", file.local_path, e);
            }
        }
    }

    /// Subscribe to namespace events and apply them: `local_path`
    /// rewrites on moves, `deleted_locally` on deletes, each persisted
    /// immediately. Events arrive through a channel so the namespace
    /// lock is never held while descriptors are written.
    pub fn bind_namespace(self: &Arc<Self>, namespace: &VirtualNamespace) -> JoinHandle<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<NamespaceEvent>();
        namespace.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                registry.apply_event(&event).await;
            }
        })
    }

    async fn apply_event(&self, event: &NamespaceEvent) {
        match event {
            NamespaceEvent::FileDeleted { path } => {
                let snapshot = {
                    let mut inner = self.inner.write().await;
                    inner.file_mut_by_path(path).map(|(container, idx)| {
                        container.files[idx].deleted_locally = true;
                        container.clone()
                    })
                };
                if let Some(container) = snapshot {
                    self.persist_inner(&container).await;
                }
            }
            NamespaceEvent::FileMoved { old, new } => {
                let snapshot = {
                    let mut inner = self.inner.write().await;
                    inner.file_mut_by_path(old).map(|(container, idx)| {
                        container.files[idx].local_path = new.clone();
                        container.clone()
                    })
                };
                if let Some(container) = snapshot {
                    self.persist_inner(&container).await;
                }
            }
            NamespaceEvent::FolderMoved { old, new } => {
                let snapshots = {
                    let mut inner = self.inner.write().await;
                    let mut affected = Vec::new();
                    for container in inner.by_hash.values_mut() {
                        let mut changed = false;
                        for file in &mut container.files {
                            if let Some(rewritten) = path::reparent(&file.local_path, old, new) {
                                file.local_path = rewritten;
                                changed = true;
                            }
                        }
                        if changed {
                            affected.push(container.clone());
                        }
                    }
                    affected
                };
                for container in snapshots {
                    self.persist_inner(&container).await;
                }
            }
            // Folder deletion already emitted one event per file;
            // additions set local_path at creation time.
            NamespaceEvent::FileAdded { .. }
            | NamespaceEvent::FolderAdded { .. }
            | NamespaceEvent::FolderDeleted { .. } => {}
        }
    }
}

impl Inner {
    fn file_mut_by_path(&mut self, local_path: &str) -> Option<(&mut Container, usize)> {
        for container in self.by_hash.values_mut() {
            let position = container
                .files
                .iter()
                .position(|f| path::eq_ci(&f.local_path, local_path));
            if let Some(idx) = position {
                return Some((container, idx));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileId;
    use tempfile::TempDir;

    async fn setup() -> (Arc<ContainerRegistry>, Arc<VirtualNamespace>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(
            PersistedStore::new(tmp.path().to_path_buf())
                .await
                .unwrap(),
        );
        let registry = Arc::new(ContainerRegistry::new(store));
        let namespace = Arc::new(VirtualNamespace::new());
        (registry, namespace, tmp)
    }

    fn remote(hash: &str, status: &str) -> RemoteContainer {
        RemoteContainer {
            host_id: HostId::new(format!("H-{}", hash)),
            hash: ContainerHash::new(hash),
            name: format!("container {}", hash),
            status: status.to_string(),
            size: 1000,
            bytes_done: 0,
            speed_bps: 0,
            seeders: 4,
            added_at: None,
            files: Vec::new(),
            links: Vec::new(),
        }
    }

    fn entry(id: u32, local_path: &str) -> FileEntry {
        FileEntry {
            file_id: FileId(id),
            host_id: HostId::new(format!("F{}", id)),
            size: 100,
            restricted_link: format!("restricted-{}", id),
            download_url: Some(format!("https://cdn/{}", id)),
            local_path: local_path.to_string(),
            deleted_locally: false,
            media_info: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_tracks_status() {
        let (registry, _ns, _tmp) = setup().await;

        let change = registry.upsert_remote(&remote("aaaa", "downloading")).await;
        assert_eq!(change, RemoteChange::Created);

        let change = registry.upsert_remote(&remote("aaaa", "downloading")).await;
        assert_eq!(change, RemoteChange::Unchanged);

        let change = registry.upsert_remote(&remote("aaaa", "downloaded")).await;
        assert_eq!(
            change,
            RemoteChange::StatusChanged {
                from: RemoteStatus::Downloading,
                to: RemoteStatus::Downloaded
            }
        );
        let container = registry.get(&ContainerHash::new("aaaa")).await.unwrap();
        assert_eq!(container.remote_status, RemoteStatus::Downloaded);
    }

    #[tokio::test]
    async fn test_persist_and_reload_round_trip() {
        let (registry, namespace, tmp) = setup().await;
        registry.upsert_remote(&remote("bbbb", "downloaded")).await;
        registry
            .attach_files(
                &ContainerHash::new("bbbb"),
                None,
                vec![entry(0, "/container bbbb/a.mkv"), entry(1, "/container bbbb/b.mkv")],
            )
            .await;

        // Fresh registry from the same store directory.
        let store = Arc::new(
            PersistedStore::new(tmp.path().to_path_buf())
                .await
                .unwrap(),
        );
        let reloaded = Arc::new(ContainerRegistry::new(store));
        let count = reloaded.load_from_store(&namespace).await.unwrap();
        assert_eq!(count, 1);

        // Every file is reachable again at its local_path.
        assert!(namespace.file_exists("/container bbbb/a.mkv"));
        assert!(namespace.file_exists("/container bbbb/b.mkv"));
        let descriptor = reloaded
            .file_descriptor(&FileKey::new("bbbb", 1))
            .await
            .unwrap();
        assert_eq!(descriptor.download_url.as_deref(), Some("https://cdn/1"));
    }

    #[tokio::test]
    async fn test_namespace_events_rewrite_local_paths() {
        let (registry, namespace, _tmp) = setup().await;
        let _events = registry.bind_namespace(&namespace);

        registry.upsert_remote(&remote("cccc", "downloaded")).await;
        let hash = ContainerHash::new("cccc");
        let added = namespace
            .add_file(
                "/container cccc/s1/e1.mkv",
                FileRef {
                    key: FileKey::new("cccc", 0),
                    size: 100,
                },
            )
            .unwrap();
        registry
            .attach_files(&hash, None, vec![entry(0, &added)])
            .await;

        namespace
            .move_folder("/container cccc", "/Renamed Show")
            .unwrap();
        // The event pipeline is asynchronous; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let container = registry.get(&hash).await.unwrap();
        assert_eq!(container.files[0].local_path, "/Renamed Show/s1/e1.mkv");

        namespace.delete_file("/Renamed Show/s1/e1.mkv").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let container = registry.get(&hash).await.unwrap();
        assert!(container.files[0].deleted_locally);
    }

    #[tokio::test]
    async fn test_remove_tombstones_or_purges() {
        let (registry, _ns, tmp) = setup().await;
        registry.upsert_remote(&remote("dddd", "downloaded")).await;
        registry.upsert_remote(&remote("eeee", "downloaded")).await;

        registry.remove(&ContainerHash::new("dddd"), false).await;
        assert!(
            tmp.path()
                .join("Deleted")
                .join("H-dddd.trd")
                .exists()
        );

        registry.remove(&ContainerHash::new("eeee"), true).await;
        assert!(!tmp.path().join("Active").join("H-eeee.trd").exists());
        assert!(!tmp.path().join("Deleted").join("H-eeee.trd").exists());
    }

    #[tokio::test]
    async fn test_verification_counter_tracks_consecutive_failures() {
        let (registry, _ns, _tmp) = setup().await;
        registry.upsert_remote(&remote("9999", "downloaded")).await;
        let hash = ContainerHash::new("9999");

        assert_eq!(registry.mark_verification_failed(&hash).await, 1);
        assert_eq!(registry.mark_verification_failed(&hash).await, 2);

        // A success resets the streak.
        registry.mark_verified(&hash).await;
        let container = registry.get(&hash).await.unwrap();
        assert_eq!(container.verification_attempts, 0);
        assert!(container.last_verified.is_some());

        assert_eq!(registry.mark_verification_failed(&hash).await, 1);
    }

    #[tokio::test]
    async fn test_problematic_container_moves_directory() {
        let (registry, _ns, tmp) = setup().await;
        registry.upsert_remote(&remote("ffff", "downloading")).await;
        registry
            .mark_problematic(&ContainerHash::new("ffff"), "stalled", None)
            .await;

        assert!(
            tmp.path()
                .join("Problematic")
                .join("H-ffff.trd")
                .exists()
        );
        assert!(!tmp.path().join("Active").join("H-ffff.trd").exists());
        let container = registry.get(&ContainerHash::new("ffff")).await.unwrap();
        assert_eq!(container.lifecycle_state, LifecycleState::Problematic);
        assert_eq!(container.problem_reason.as_deref(), Some("stalled"));
    }
}
