use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::descriptor::DESCRIPTOR_EXT;
use crate::models::HostId;

/// Watches `Active/` for externally removed descriptor files. Removing
/// a `.trd` file is the supported way for an operator to drop a
/// container; the engine reacts by deleting its files from the
/// namespace.
pub struct DescriptorWatcher {
    _watcher: RecommendedWatcher,
}

impl DescriptorWatcher {
    pub fn watch_removals(dir: &Path, sender: UnboundedSender<HostId>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("Descriptor watcher error: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Remove(_)) {
                return;
            }
            for path in &event.paths {
                let is_descriptor = path
                    .extension()
                    .map(|ext| ext == DESCRIPTOR_EXT)
                    .unwrap_or(false);
                if !is_descriptor {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    debug!("Descriptor {} removed externally", stem);
                    let _ = sender.send(HostId::new(stem));
                }
            }
        })
        .context("Failed to create descriptor watcher")?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;
        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_removal_is_reported() {
        let tmp = TempDir::new().unwrap();
        let descriptor = tmp.path().join("HOST1.trd");
        std::fs::write(&descriptor, "{}").unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _watcher = DescriptorWatcher::watch_removals(tmp.path(), tx).unwrap();

        // Give the watcher backend a moment to arm before deleting.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::remove_file(&descriptor).unwrap();

        let host_id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for removal event")
            .expect("watcher channel closed");
        assert_eq!(host_id.as_str(), "HOST1");
    }
}
