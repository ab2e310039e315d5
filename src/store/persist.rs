use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::descriptor::{self, DESCRIPTOR_EXT, StoreCategory};
use crate::models::{Container, HostId};

/// On-disk container store: one whole-file JSON descriptor per
/// container under `Active/`, `Deleted/` or `Problematic/`. A single
/// store lock serialises writes and directory moves.
pub struct PersistedStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl PersistedStore {
    pub async fn new(root: PathBuf) -> Result<Self> {
        for category in StoreCategory::ALL {
            fs::create_dir_all(root.join(category.dir_name()))
                .await
                .with_context(|| format!("Failed to create {} directory", category.dir_name()))?;
        }
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self, category: StoreCategory) -> PathBuf {
        self.root.join(category.dir_name())
    }

    pub fn active_dir(&self) -> PathBuf {
        self.dir(StoreCategory::Active)
    }

    fn descriptor_path(&self, category: StoreCategory, host_id: &HostId) -> PathBuf {
        self.dir(category).join(descriptor::descriptor_file_name(host_id))
    }

    /// Write the descriptor into `category` (temp file + atomic
    /// rename) and drop any copy in the other two directories.
    pub async fn save(&self, container: &Container, category: StoreCategory) -> Result<()> {
        let _guard = self.lock.lock().await;

        let json = descriptor::to_json(container)?;
        let final_path = self.descriptor_path(category, &container.host_id);
        let tmp_path = final_path.with_extension(format!("{}.tmp", DESCRIPTOR_EXT));

        let mut file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create {:?}", tmp_path))?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to commit {:?}", final_path))?;

        for other in StoreCategory::ALL {
            if other != category {
                let _ = fs::remove_file(self.descriptor_path(other, &container.host_id)).await;
            }
        }
        debug!(
            "Persisted container {} under {}/",
            container.host_id,
            category.dir_name()
        );
        Ok(())
    }

    /// Purge the descriptor from every directory.
    pub async fn remove(&self, host_id: &HostId) -> Result<()> {
        let _guard = self.lock.lock().await;
        for category in StoreCategory::ALL {
            let _ = fs::remove_file(self.descriptor_path(category, host_id)).await;
        }
        Ok(())
    }

    /// Load every parseable descriptor. Corrupt files are logged and
    /// skipped so one bad descriptor never blocks startup.
    pub async fn load_all(&self) -> Result<Vec<(Container, StoreCategory)>> {
        let _guard = self.lock.lock().await;
        let mut loaded = Vec::new();
        for category in StoreCategory::ALL {
            let dir = self.dir(category);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", dir)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().map(|e| e != DESCRIPTOR_EXT).unwrap_or(true) {
                    continue;
                }
                match read_descriptor(&path).await {
                    Ok(container) => loaded.push((container, category)),
                    Err(e) => warn!("Skipping unreadable descriptor {:?}: {:#}", path, e),
                }
            }
        }
        Ok(loaded)
    }
}

async fn read_descriptor(path: &Path) -> Result<Container> {
    let json = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    descriptor::from_json(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerHash;
    use tempfile::TempDir;

    fn container(host: &str) -> Container {
        Container::new(
            HostId::new(host),
            ContainerHash::new(format!("hash-{}", host)),
            format!("name-{}", host),
        )
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = PersistedStore::new(tmp.path().to_path_buf()).await.unwrap();

        store
            .save(&container("A"), StoreCategory::Active)
            .await
            .unwrap();
        store
            .save(&container("B"), StoreCategory::Problematic)
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        let a = loaded
            .iter()
            .find(|(c, _)| c.host_id.as_str() == "A")
            .unwrap();
        assert_eq!(a.1, StoreCategory::Active);
        let b = loaded
            .iter()
            .find(|(c, _)| c.host_id.as_str() == "B")
            .unwrap();
        assert_eq!(b.1, StoreCategory::Problematic);
    }

    #[tokio::test]
    async fn test_save_moves_between_categories() {
        let tmp = TempDir::new().unwrap();
        let store = PersistedStore::new(tmp.path().to_path_buf()).await.unwrap();
        let c = container("A");

        store.save(&c, StoreCategory::Active).await.unwrap();
        store.save(&c, StoreCategory::Problematic).await.unwrap();

        assert!(!store.dir(StoreCategory::Active).join("A.trd").exists());
        assert!(
            store
                .dir(StoreCategory::Problematic)
                .join("A.trd")
                .exists()
        );
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_descriptor_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = PersistedStore::new(tmp.path().to_path_buf()).await.unwrap();
        store
            .save(&container("A"), StoreCategory::Active)
            .await
            .unwrap();
        std::fs::write(store.active_dir().join("BAD.trd"), "{not json").unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.host_id.as_str(), "A");
    }

    #[tokio::test]
    async fn test_remove_purges_everywhere() {
        let tmp = TempDir::new().unwrap();
        let store = PersistedStore::new(tmp.path().to_path_buf()).await.unwrap();
        let c = container("A");
        store.save(&c, StoreCategory::Deleted).await.unwrap();

        store.remove(&c.host_id).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
