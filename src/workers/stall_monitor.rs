use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconciliationConfig;
use crate::models::{LifecycleState, RemoteStatus, TransferSample};
use crate::provider::RemoteProvider;
use crate::registry::ContainerRegistry;

const SCAN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Watches transferring containers for stalls: speed below threshold
/// or zero seeders for longer than the configured window, or the
/// provider reporting `stalled` outright. Stalled containers become
/// problematic and are deleted upstream.
pub struct StallMonitor {
    provider: Arc<dyn RemoteProvider>,
    registry: Arc<ContainerRegistry>,
    config: ReconciliationConfig,
}

impl StallMonitor {
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
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!("Stall scan failed: {:#}", e);
                    }
                }
                _ = token.cancelled() => {
                    debug!("Stall monitor stopping");
                    break;
                }
            }
        }
    }

    pub async fn scan_once(&self) -> Result<()> {
        let now = Utc::now();
        let window = ChronoDuration::minutes(self.config.stall_detection_minutes as i64);

        for container in self.registry.all().await {
            if container.lifecycle_state != LifecycleState::Active
                || !container.remote_status.is_transferring()
            {
                continue;
            }

            let info = match self.provider.info(&container.host_id).await {
                Ok(info) => info,
                Err(e) => {
                    debug!("Could not refresh {}: {}", container.host_id, e);
                    continue;
                }
            };
            let status = RemoteStatus::from_upstream(&info.status);

            let previous = container.transfer.unwrap_or_default();
            let slow = info.speed_bps < self.config.stall_speed_bytes_per_sec;
            let slow_since = if slow {
                previous.slow_since.or(Some(now))
            } else {
                None
            };
            let seedless_since = if info.seeders == 0 {
                previous.seedless_since.or(Some(now))
            } else {
                None
            };
            self.registry
                .set_transfer(
                    &container.hash,
                    TransferSample {
                        bytes_done: info.bytes_done,
                        speed_bps: info.speed_bps,
                        seeders: info.seeders,
                        slow_since,
                        seedless_since,
                    },
                )
                .await;

            let slow_too_long = slow_since.map(|t| now - t >= window).unwrap_or(false);
            let seedless_too_long = seedless_since.map(|t| now - t >= window).unwrap_or(false);
            let reported_stalled = status == RemoteStatus::Stalled;
            if !(slow_too_long || seedless_too_long || reported_stalled) {
                continue;
            }

            let reason = if reported_stalled {
                "provider_reported_stalled"
            } else if seedless_too_long {
                "no_seeders"
            } else {
                "transfer_too_slow"
            };
            info!(
                "Container {} stalled ({}): {} B/s, {} seeders",
                container.hash, reason, info.speed_bps, info.seeders
            );
            self.registry
                .mark_problematic(
                    &container.hash,
                    reason,
                    Some(format!(
                        "speed {} B/s, {} seeders",
                        info.speed_bps, info.seeders
                    )),
                )
                .await;
            if let Err(e) = self.provider.delete(&container.host_id).await {
                warn!(
                    "Failed to delete stalled container {} upstream: {}",
                    container.host_id, e
                );
            }
        }
        Ok(())
    }
}
