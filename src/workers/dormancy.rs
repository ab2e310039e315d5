use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconciliationConfig;
use crate::error::{VfsError, VfsResult};
use crate::models::{Container, ContainerHash, LifecycleState, RemoteStatus};
use crate::provider::RemoteProvider;
use crate::registry::ContainerRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);
/// How long a restore waits for the provider to re-materialise a
/// cached container.
const RESTORE_POLL_ATTEMPTS: u32 = 30;
const RESTORE_POLL_DELAY: Duration = Duration::from_secs(2);
/// Re-verification failures tolerated before a dormant container is
/// written off as problematic.
const MAX_VERIFICATION_FAILURES: u32 = 5;

/// Frees upstream slots: downloaded containers that have not been read
/// for `keep_active_hours` are verified, deleted upstream and marked
/// dormant. A bounded batch of dormant containers is re-verified per
/// sweep, and `restore` brings one back before a read.
pub struct DormancyManager {
    provider: Arc<dyn RemoteProvider>,
    registry: Arc<ContainerRegistry>,
    config: ReconciliationConfig,
}

impl DormancyManager {
    pub fn new(
        provider: Arc<dyn RemoteProvider>,
        registry: Arc<ContainerRegistry>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        if !self.config.enable_dormant {
            debug!("Dormancy disabled, worker not running");
            return;
        }
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!("Dormancy sweep failed: {:#}", e);
                    }
                }
                _ = token.cancelled() => {
                    debug!("Dormancy manager stopping");
                    break;
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::hours(self.config.keep_active_hours as i64);
        let all = self.registry.all().await;

        for container in &all {
            let eligible = container.lifecycle_state == LifecycleState::Active
                && container.remote_status == RemoteStatus::Downloaded
                && !container.files.is_empty();
            if !eligible {
                continue;
            }
            let last_used = container.last_accessed.unwrap_or(container.added_at);
            if last_used >= cutoff {
                continue;
            }
            if let Err(e) = self.hibernate(container).await {
                warn!("Could not hibernate {}: {:#}", container.hash, e);
            }
        }

        // Re-verify the dormant containers that have waited longest.
        let mut dormant: Vec<Container> = all
            .into_iter()
            .filter(|c| c.lifecycle_state == LifecycleState::Dormant)
            .collect();
        dormant.sort_by_key(|c| c.last_verified);
        for container in dormant
            .into_iter()
            .take(self.config.dormant_verification_batch)
        {
            if let Err(e) = self.reverify(&container).await {
                warn!("Re-verification of {} failed: {:#}", container.hash, e);
            }
        }
        Ok(())
    }

    /// Check every link, then free the upstream slot and mark dormant.
    /// A container with an unverifiable link stays active and is
    /// retried on the next sweep.
    async fn hibernate(&self, container: &Container) -> Result<()> {
        for file in &container.files {
            if file.deleted_locally {
                continue;
            }
            let check = self.provider.check_link(&file.restricted_link).await?;
            if !check.supported {
                self.registry
                    .mark_verification_failed(&container.hash)
                    .await;
                anyhow::bail!("link {} no longer supported", file.restricted_link);
            }
        }

        if let Err(e) = self.provider.delete(&container.host_id).await {
            warn!(
                "Upstream delete of {} failed (continuing): {}",
                container.host_id, e
            );
        }
        self.registry.mark_verified(&container.hash).await;
        self.registry
            .set_lifecycle(&container.hash, LifecycleState::Dormant)
            .await;
        info!("Container {} is now dormant", container.hash);
        Ok(())
    }

    /// Temporarily re-add a dormant container to prove it still
    /// restores, then delete it again.
    async fn reverify(&self, container: &Container) -> Result<()> {
        match self.restore(&container.hash).await {
            Ok(()) => {
                if let Err(e) = self.hibernate_by_hash(&container.hash).await {
                    warn!("Could not re-hibernate {}: {:#}", container.hash, e);
                }
                Ok(())
            }
            Err(e) => {
                let failures = self
                    .registry
                    .mark_verification_failed(&container.hash)
                    .await;
                if failures >= MAX_VERIFICATION_FAILURES {
                    self.registry
                        .mark_problematic(
                            &container.hash,
                            "dormant_verification_failed",
                            Some(e.to_string()),
                        )
                        .await;
                }
                Err(anyhow::anyhow!(e))
            }
        }
    }

    async fn hibernate_by_hash(&self, hash: &ContainerHash) -> Result<()> {
        match self.registry.get(hash).await {
            Some(container) => self.hibernate(&container).await,
            None => Ok(()),
        }
    }

    /// Bring a dormant container back: re-add its magnet, select all
    /// files, wait for the provider to report it downloaded (cached
    /// content restores quickly), then refresh every link. Reads block
    /// on this before touching the cache.
    pub async fn restore(&self, hash: &ContainerHash) -> VfsResult<()> {
        let container = self
            .registry
            .get(hash)
            .await
            .ok_or_else(|| VfsError::NotFound(hash.to_string()))?;
        if container.lifecycle_state != LifecycleState::Dormant {
            return Ok(());
        }
        info!("Restoring dormant container {}", hash);

        let magnet = format!("magnet:?xt=urn:btih:{}", hash);
        let added = self
            .provider
            .add_magnet(&magnet, "default")
            .await
            .map_err(|e| VfsError::FetchFailed(e.to_string()))?;
        self.provider
            .select_files(&added.host_id, "all")
            .await
            .map_err(|e| VfsError::FetchFailed(e.to_string()))?;

        let mut info = None;
        for _ in 0..RESTORE_POLL_ATTEMPTS {
            let current = self
                .provider
                .info(&added.host_id)
                .await
                .map_err(|e| VfsError::FetchFailed(e.to_string()))?;
            if RemoteStatus::from_upstream(&current.status) == RemoteStatus::Downloaded {
                info = Some(current);
                break;
            }
            tokio::time::sleep(RESTORE_POLL_DELAY).await;
        }
        let info = info.ok_or_else(|| {
            VfsError::FetchFailed(format!("restore of {} did not reach downloaded state", hash))
        })?;

        let selected: Vec<_> = info.files.iter().filter(|f| f.selected).collect();
        if selected.len() != info.links.len() {
            return Err(VfsError::FetchFailed(format!(
                "restore of {}: {} files but {} links",
                hash,
                selected.len(),
                info.links.len()
            )));
        }
        let mut refreshed = Vec::new();
        for (file, link) in selected.iter().zip(info.links.iter()) {
            let unrestricted = self
                .provider
                .unrestrict(link)
                .await
                .map_err(|e| VfsError::FetchFailed(e.to_string()))?;
            refreshed.push((file.id, link.clone(), unrestricted));
        }

        self.registry
            .refresh_links(hash, info.host_id.clone(), refreshed)
            .await;
        self.registry
            .set_lifecycle(hash, LifecycleState::Active)
            .await;
        self.registry.mark_verified(hash).await;
        info!("Container {} restored", hash);
        Ok(())
    }
}
