use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheStatsSnapshot, CachedFile, ChunkCache, ChunkStore};
use crate::config::Config;
use crate::error::{VfsError, VfsResult};
use crate::merged::{LinkResolver, MergedView};
use crate::models::{Container, ContainerHash, FileKey, LifecycleState};
use crate::provider::RemoteProvider;
use crate::registry::{ContainerRegistry, FileDescriptor};
use crate::store::{DescriptorWatcher, PersistedStore};
use crate::vfs::VirtualNamespace;
use crate::workers::{DormancyManager, StallMonitor, UpstreamPoller};

/// Assembles the component graph and owns its lifetime: persisted
/// store -> registry -> namespace -> chunk cache -> merged view, plus
/// the reconciliation workers and the descriptor watcher.
pub struct Engine {
    config: Config,
    provider: Arc<dyn RemoteProvider>,
    registry: Arc<ContainerRegistry>,
    namespace: Arc<VirtualNamespace>,
    cache: Arc<ChunkCache>,
    merged: Arc<MergedView>,
    dormancy: Arc<DormancyManager>,
    shutdown: CancellationToken,
    _watcher: DescriptorWatcher,
}

impl Engine {
    pub async fn new(config: Config, provider: Arc<dyn RemoteProvider>) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.paths.local_root)
            .await
            .context("Failed to create local overlay directory")?;

        let store = Arc::new(
            PersistedStore::new(config.paths.store_root.clone())
                .await
                .context("Failed to initialise container store")?,
        );
        let registry = Arc::new(ContainerRegistry::new(store.clone()));
        let namespace = Arc::new(VirtualNamespace::new());
        let _event_pump = registry.bind_namespace(&namespace);

        let chunk_store = Arc::new(ChunkStore::new(config.paths.cache_root.clone()));
        let report = chunk_store
            .scan()
            .await
            .map_err(|e| anyhow::anyhow!("Chunk store scan failed: {}", e))?;
        info!(
            "Chunk cache: {} files, {} chunks, {} MB on disk",
            report.file_count,
            report.chunk_count,
            report.total_bytes / (1024 * 1024)
        );
        let cache = Arc::new(ChunkCache::new(
            provider.clone(),
            chunk_store,
            &config.cache,
        ));

        let loaded = registry
            .load_from_store(&namespace)
            .await
            .context("Failed to load persisted containers")?;
        info!("Namespace rebuilt from {} containers", loaded);

        let dormancy = Arc::new(DormancyManager::new(
            provider.clone(),
            registry.clone(),
            config.reconciliation.clone(),
        ));
        let resolver = Arc::new(EngineResolver {
            registry: registry.clone(),
            provider: provider.clone(),
            dormancy: dormancy.clone(),
        });
        let merged = MergedView::new(
            namespace.clone(),
            cache.clone(),
            resolver,
            config.paths.local_root.clone(),
        );

        let (removed_tx, mut removed_rx) = tokio::sync::mpsc::unbounded_channel();
        let watcher = DescriptorWatcher::watch_removals(&store.active_dir(), removed_tx)
            .context("Failed to start descriptor watcher")?;
        {
            let registry = registry.clone();
            let namespace = namespace.clone();
            tokio::spawn(async move {
                while let Some(host_id) = removed_rx.recv().await {
                    registry.apply_external_deletion(&host_id, &namespace).await;
                }
            });
        }

        Ok(Arc::new(Self {
            config,
            provider,
            registry,
            namespace,
            cache,
            merged,
            dormancy,
            shutdown: CancellationToken::new(),
            _watcher: watcher,
        }))
    }

    pub fn merged(&self) -> Arc<MergedView> {
        self.merged.clone()
    }

    pub fn namespace(&self) -> Arc<VirtualNamespace> {
        self.namespace.clone()
    }

    pub fn registry(&self) -> Arc<ContainerRegistry> {
        self.registry.clone()
    }

    pub fn statistics(&self) -> CacheStatsSnapshot {
        self.cache.statistics()
    }

    /// Start the reconciliation loops. They stop on [`Engine::shutdown`].
    pub fn spawn_workers(self: &Arc<Self>) {
        let poller = Arc::new(UpstreamPoller::new(
            self.provider.clone(),
            self.registry.clone(),
            self.namespace.clone(),
            self.config.reconciliation.clone(),
        ));
        tokio::spawn(poller.run(self.shutdown.child_token()));

        let stall = Arc::new(StallMonitor::new(
            self.provider.clone(),
            self.registry.clone(),
            self.config.reconciliation.clone(),
        ));
        tokio::spawn(stall.run(self.shutdown.child_token()));

        tokio::spawn(self.dormancy.clone().run(self.shutdown.child_token()));
        info!("Reconciliation workers started");
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Compat-API seam: add a magnet and select all files.
    pub async fn add_magnet(
        &self,
        uri: &str,
        category: Option<String>,
    ) -> Result<ContainerHash> {
        let added = self
            .provider
            .add_magnet(uri, "default")
            .await
            .context("Provider rejected the magnet")?;
        self.provider
            .select_files(&added.host_id, "all")
            .await
            .context("File selection failed")?;
        let info = self
            .provider
            .info(&added.host_id)
            .await
            .context("Could not fetch container info")?;
        self.registry.upsert_remote(&info).await;
        if category.is_some() {
            self.registry.set_category(&info.hash, category).await;
        }
        info!("Added magnet as container {}", info.hash);
        Ok(info.hash)
    }

    /// Compat-API seam: add a torrent file and select all files.
    pub async fn add_torrent(
        &self,
        bytes: &[u8],
        category: Option<String>,
    ) -> Result<ContainerHash> {
        let added = self
            .provider
            .add_torrent(bytes, "default", category.as_deref(), None)
            .await
            .context("Provider rejected the torrent")?;
        self.provider
            .select_files(&added.host_id, "all")
            .await
            .context("File selection failed")?;
        let info = self
            .provider
            .info(&added.host_id)
            .await
            .context("Could not fetch container info")?;
        self.registry.upsert_remote(&info).await;
        if category.is_some() {
            self.registry.set_category(&info.hash, category).await;
        }
        Ok(info.hash)
    }

    pub async fn list_containers(&self) -> Vec<Container> {
        self.registry.all().await
    }

    /// Compat-API seam: delete a container everywhere. With `purge`
    /// the descriptor is destroyed instead of tombstoned.
    pub async fn delete_container(&self, hash: &ContainerHash, purge: bool) -> Result<()> {
        let container = self
            .registry
            .get(hash)
            .await
            .with_context(|| format!("Unknown container {}", hash))?;

        if container.lifecycle_state != LifecycleState::Dormant {
            if let Err(e) = self.provider.delete(&container.host_id).await {
                warn!("Upstream delete of {} failed: {}", container.host_id, e);
            }
        }
        for file in &container.files {
            if !file.deleted_locally && !file.local_path.is_empty() {
                if let Err(e) = self.namespace.delete_file(&file.local_path) {
                    warn!("Namespace delete of {} failed: {}", file.local_path, e);
                }
            }
            if let Err(e) = self.cache.invalidate(&container.file_key(file.file_id)).await {
                warn!("Cache invalidation for {} failed: {}", file.file_id, e);
            }
        }
        self.registry.remove(hash, purge).await;
        info!("Container {} deleted (purge: {})", hash, purge);
        Ok(())
    }

    /// Bring a dormant container back before a read.
    pub async fn restore(&self, hash: &ContainerHash) -> VfsResult<()> {
        self.dormancy.restore(hash).await
    }
}

/// [`LinkResolver`] over the registry, the provider and the dormancy
/// manager: restores dormant containers, unrestricts missing or stale
/// URLs, and tracks access recency.
struct EngineResolver {
    registry: Arc<ContainerRegistry>,
    provider: Arc<dyn RemoteProvider>,
    dormancy: Arc<DormancyManager>,
}

impl EngineResolver {
    async fn unrestrict_now(&self, descriptor: &FileDescriptor) -> VfsResult<String> {
        let unrestricted = self
            .provider
            .unrestrict(&descriptor.restricted_link)
            .await
            .map_err(|e| VfsError::FetchFailed(e.to_string()))?;
        self.registry
            .update_file_url(
                &descriptor.key,
                unrestricted.host_id.clone(),
                unrestricted.download_url.clone(),
            )
            .await;
        Ok(unrestricted.download_url)
    }

    async fn descriptor(&self, key: &FileKey) -> VfsResult<FileDescriptor> {
        let descriptor = self
            .registry
            .file_descriptor(key)
            .await
            .ok_or_else(|| VfsError::NotFound(key.to_string()))?;
        if descriptor.deleted {
            return Err(VfsError::NotFound(key.to_string()));
        }
        Ok(descriptor)
    }
}

#[async_trait]
impl LinkResolver for EngineResolver {
    async fn resolve(&self, key: &FileKey) -> VfsResult<CachedFile> {
        let mut descriptor = self.descriptor(key).await?;
        if descriptor.lifecycle == LifecycleState::Dormant {
            self.dormancy.restore(&key.hash).await?;
            descriptor = self.descriptor(key).await?;
        }
        let url = match descriptor.download_url.clone() {
            Some(url) => url,
            None => self.unrestrict_now(&descriptor).await?,
        };
        self.registry.touch_access(&key.hash).await;
        Ok(CachedFile {
            key: key.clone(),
            size: descriptor.size,
            url,
        })
    }

    async fn refresh(&self, key: &FileKey) -> VfsResult<CachedFile> {
        let descriptor = self.descriptor(key).await?;
        let url = self.unrestrict_now(&descriptor).await?;
        Ok(CachedFile {
            key: key.clone(),
            size: descriptor.size,
            url,
        })
    }
}
