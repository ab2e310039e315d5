use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconciliationConfig;
use crate::models::{ContainerHash, FileEntry, FileKey, HostId, LifecycleState, RemoteStatus};
use crate::provider::RemoteProvider;
use crate::registry::{ContainerRegistry, RemoteChange};
use crate::util::lock_unpoisoned;
use crate::vfs::{FileRef, VirtualNamespace};

const PAGE_LIMIT: u32 = 50;
/// A container's completion pipeline runs at most this often.
const COMPLETION_CEILING: Duration = Duration::from_secs(5 * 60);

/// Polls the provider, folds observations into the registry and runs
/// the completion pipeline for freshly downloaded containers.
pub struct UpstreamPoller {
    provider: Arc<dyn RemoteProvider>,
    registry: Arc<ContainerRegistry>,
    namespace: Arc<VirtualNamespace>,
    config: ReconciliationConfig,
    completion_attempts: StdMutex<HashMap<ContainerHash, Instant>>,
}

impl UpstreamPoller {
    pub fn new(
        provider: Arc<dyn RemoteProvider>,
        registry: Arc<ContainerRegistry>,
        namespace: Arc<VirtualNamespace>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            namespace,
            config,
            completion_attempts: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Upstream poller started (every {}s)",
            self.config.poll_interval_seconds
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("Upstream poll failed: {:#}", e);
                    }
                }
                _ = token.cancelled() => {
                    debug!("Upstream poller stopping");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass over the provider's full listing.
    pub async fn poll_once(&self) -> Result<()> {
        let mut page = 1;
        let mut remotes = Vec::new();
        loop {
            let batch = self
                .provider
                .list(page, PAGE_LIMIT, None)
                .await
                .with_context(|| format!("Failed to list page {}", page))?;
            let last_page = batch.len() < PAGE_LIMIT as usize;
            remotes.extend(batch);
            if last_page {
                break;
            }
            page += 1;
        }

        for remote in &remotes {
            match self.registry.upsert_remote(remote).await {
                RemoteChange::Created => {
                    info!("Observed new container {} ({})", remote.name, remote.hash);
                }
                RemoteChange::StatusChanged { from, to } => {
                    info!("Container {} went {:?} -> {:?}", remote.hash, from, to);
                }
                RemoteChange::Unchanged => {}
            }

            if RemoteStatus::from_upstream(&remote.status) != RemoteStatus::Downloaded {
                continue;
            }
            let Some(container) = self.registry.get(&remote.hash).await else {
                continue;
            };
            let needs_completion = container.files.is_empty()
                && container.lifecycle_state == LifecycleState::Active;
            if needs_completion && self.completion_due(&remote.hash) {
                if let Err(e) = self.complete(&remote.hash, &remote.host_id).await {
                    warn!("Completion pipeline for {} failed: {:#}", remote.hash, e);
                }
            }
        }
        Ok(())
    }

    fn completion_due(&self, hash: &ContainerHash) -> bool {
        let mut attempts = lock_unpoisoned(&self.completion_attempts);
        match attempts.get(hash) {
            Some(last) if last.elapsed() < COMPLETION_CEILING => false,
            _ => {
                attempts.insert(hash.clone(), Instant::now());
                true
            }
        }
    }

    /// Completion pipeline: refresh full info, reject containers with
    /// blocked extensions, then unrestrict every selected file and
    /// publish the result into the namespace. The container only
    /// becomes problematic when every link fails.
    pub async fn complete(&self, hash: &ContainerHash, host_id: &HostId) -> Result<()> {
        let info = self
            .provider
            .info(host_id)
            .await
            .context("Failed to refresh container info")?;

        let selected: Vec<_> = info.files.iter().filter(|f| f.selected).collect();
        if let Some(blocked) = selected
            .iter()
            .find(|f| self.config.is_extension_blocked(&f.path))
        {
            self.registry
                .mark_problematic(hash, "blocked_file_extension", Some(blocked.path.clone()))
                .await;
            return Ok(());
        }
        if selected.len() != info.links.len() {
            self.registry
                .mark_problematic(
                    hash,
                    "file_link_count_mismatch",
                    Some(format!(
                        "{} selected files, {} links",
                        selected.len(),
                        info.links.len()
                    )),
                )
                .await;
            return Ok(());
        }

        let mut entries = Vec::new();
        let mut failures = Vec::new();
        for (file, link) in selected.iter().zip(info.links.iter()) {
            match self.provider.unrestrict(link).await {
                Ok(unrestricted) => {
                    let file_ref = FileRef {
                        key: FileKey {
                            hash: hash.clone(),
                            file_id: file.id,
                        },
                        size: file.size,
                    };
                    let wanted =
                        format!("/{}/{}", info.name, file.path.trim_start_matches('/'));
                    let local_path = match self.namespace.add_file(&wanted, file_ref) {
                        Ok(local_path) => local_path,
                        Err(e) => {
                            warn!("Could not place {} in the namespace: {}", wanted, e);
                            failures.push(format!("{}: {}", file.path, e));
                            continue;
                        }
                    };
                    entries.push(FileEntry {
                        file_id: file.id,
                        host_id: unrestricted.host_id,
                        size: file.size,
                        restricted_link: link.clone(),
                        download_url: Some(unrestricted.download_url),
                        local_path,
                        deleted_locally: false,
                        media_info: None,
                    });
                }
                Err(e) => {
                    warn!("Unrestrict of {} for {} failed: {}", link, hash, e);
                    failures.push(format!("{}: {}", link, e));
                }
            }
        }

        if entries.is_empty() {
            self.registry
                .mark_problematic(hash, "all_links_failed", Some(failures.join("; ")))
                .await;
            return Ok(());
        }

        self.registry
            .attach_files(hash, Some(info.host_id.clone()), entries)
            .await;
        if failures.is_empty() {
            self.registry.set_problem_details(hash, None).await;
        } else {
            self.registry
                .set_problem_details(hash, Some(failures.join("; ")))
                .await;
        }
        info!(
            "Container {} completed: {} files linked, {} link failures",
            hash,
            self.registry
                .get(hash)
                .await
                .map(|c| c.files.len())
                .unwrap_or(0),
            failures.len()
        );
        Ok(())
    }
}
