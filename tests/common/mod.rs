#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use debrid_vfs::models::{ContainerHash, FileId, HostId};
use debrid_vfs::provider::{
    AddedContainer, ByteStream, LinkCheck, ProviderError, RemoteContainer, RemoteFile,
    RemoteProvider, UnrestrictedLink,
};

/// Deterministic test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Opt-in log output for debugging test runs (`RUST_LOG=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone)]
pub struct FakeFileSpec {
    pub id: u32,
    pub path: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
struct FakeEntry {
    host: String,
    hash: String,
    name: String,
    status: String,
    deleted: bool,
    files: Vec<FakeFileSpec>,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<FakeEntry>,
    urls: HashMap<String, Vec<u8>>,
    next_host: u64,
    next_generation: u64,
}

/// In-memory debrid provider: containers with files, restricted links
/// that unrestrict to generated fetch URLs, and byte-range serving.
#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<State>,
    pub fetches: AtomicU64,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(
        &self,
        hash: &str,
        name: &str,
        status: &str,
        files: Vec<FakeFileSpec>,
    ) -> HostId {
        let mut state = self.state.lock().unwrap();
        state.next_host += 1;
        let host = format!("HOST{}", state.next_host);
        state.entries.push(FakeEntry {
            host: host.clone(),
            hash: hash.to_string(),
            name: name.to_string(),
            status: status.to_string(),
            deleted: false,
            files,
        });
        HostId::new(host)
    }

    /// Register raw content behind a fetchable URL (for tests that
    /// bypass the unrestrict flow).
    pub fn seed_url(&self, url: &str, content: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .urls
            .insert(url.to_string(), content);
    }

    /// Invalidate every fetchable URL, simulating expired links.
    pub fn kill_all_urls(&self) {
        self.state.lock().unwrap().urls.clear();
    }

    pub fn set_status(&self, host: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.host == host) {
            entry.status = status.to_string();
        }
    }

    pub fn is_deleted(&self, host: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .find(|e| e.host == host)
            .map(|e| e.deleted)
            .unwrap_or(true)
    }

    fn remote_of(entry: &FakeEntry) -> RemoteContainer {
        let files: Vec<RemoteFile> = entry
            .files
            .iter()
            .map(|f| RemoteFile {
                id: FileId(f.id),
                path: f.path.clone(),
                size: f.content.len() as u64,
                selected: true,
            })
            .collect();
        let links = entry
            .files
            .iter()
            .map(|f| format!("restricted://{}/{}", entry.host, f.id))
            .collect();
        RemoteContainer {
            host_id: HostId::new(entry.host.clone()),
            hash: ContainerHash::new(entry.hash.clone()),
            name: entry.name.clone(),
            status: entry.status.clone(),
            size: entry.files.iter().map(|f| f.content.len() as u64).sum(),
            bytes_done: entry.files.iter().map(|f| f.content.len() as u64).sum(),
            speed_bps: 0,
            seeders: 1,
            added_at: Some(Utc::now()),
            files,
            links,
        }
    }
}

fn parse_restricted(link: &str) -> Option<(String, u32)> {
    let rest = link.strip_prefix("restricted://")?;
    let (host, id) = rest.split_once('/')?;
    Some((host.to_string(), id.parse().ok()?))
}

#[async_trait]
impl RemoteProvider for FakeProvider {
    async fn list(
        &self,
        page: u32,
        limit: u32,
        _filter: Option<&str>,
    ) -> Result<Vec<RemoteContainer>, ProviderError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter(|e| !e.deleted)
            .skip(((page.max(1) - 1) * limit) as usize)
            .take(limit as usize)
            .map(Self::remote_of)
            .collect())
    }

    async fn info(&self, host_id: &HostId) -> Result<RemoteContainer, ProviderError> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .find(|e| e.host == host_id.as_str() && !e.deleted)
            .map(Self::remote_of)
            .ok_or(ProviderError::Gone)
    }

    async fn add_torrent(
        &self,
        _bytes: &[u8],
        _host: &str,
        _category: Option<&str>,
        _tags: Option<&str>,
    ) -> Result<AddedContainer, ProviderError> {
        Err(ProviderError::Status(501))
    }

    async fn add_magnet(&self, uri: &str, _host: &str) -> Result<AddedContainer, ProviderError> {
        let hash = uri
            .split("btih:")
            .nth(1)
            .map(|h| h.split('&').next().unwrap_or(h).to_string())
            .ok_or_else(|| ProviderError::Other(anyhow::anyhow!("bad magnet: {}", uri)))?;

        let mut state = self.state.lock().unwrap();
        // Re-adding a known hash restores the cached container.
        if let Some(entry) = state.entries.iter_mut().find(|e| e.hash == hash) {
            entry.deleted = false;
            entry.status = "downloaded".to_string();
            return Ok(AddedContainer {
                host_id: HostId::new(entry.host.clone()),
            });
        }
        state.next_host += 1;
        let host = format!("HOST{}", state.next_host);
        state.entries.push(FakeEntry {
            host: host.clone(),
            hash,
            name: "added-by-magnet".to_string(),
            status: "queued".to_string(),
            deleted: false,
            files: Vec::new(),
        });
        Ok(AddedContainer {
            host_id: HostId::new(host),
        })
    }

    async fn select_files(&self, _host_id: &HostId, _selector: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn delete(&self, host_id: &HostId) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        match state
            .entries
            .iter_mut()
            .find(|e| e.host == host_id.as_str())
        {
            Some(entry) => {
                entry.deleted = true;
                Ok(())
            }
            None => Err(ProviderError::Gone),
        }
    }

    async fn check_link(&self, url: &str) -> Result<LinkCheck, ProviderError> {
        let state = self.state.lock().unwrap();
        let supported = parse_restricted(url)
            .map(|(host, id)| {
                state
                    .entries
                    .iter()
                    .any(|e| e.host == host && !e.deleted && e.files.iter().any(|f| f.id == id))
            })
            .unwrap_or(false);
        Ok(LinkCheck { supported })
    }

    async fn unrestrict(&self, url: &str) -> Result<UnrestrictedLink, ProviderError> {
        let (host, id) = parse_restricted(url).ok_or(ProviderError::Gone)?;
        let mut state = self.state.lock().unwrap();
        state.next_generation += 1;
        let generation = state.next_generation;
        let file = state
            .entries
            .iter()
            .find(|e| e.host == host && !e.deleted)
            .and_then(|e| e.files.iter().find(|f| f.id == id))
            .cloned()
            .ok_or(ProviderError::Gone)?;

        let download_url = format!("fetch://{}/{}/g{}", host, id, generation);
        state.urls.insert(download_url.clone(), file.content.clone());
        Ok(UnrestrictedLink {
            host_id: HostId::new(format!("{}-{}", host, id)),
            filename: file
                .path
                .rsplit('/')
                .next()
                .unwrap_or(&file.path)
                .to_string(),
            size: file.content.len() as u64,
            link: url.to_string(),
            download_url,
        })
    }

    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, ProviderError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let data = {
            let state = self.state.lock().unwrap();
            let Some(content) = state.urls.get(url) else {
                return Err(ProviderError::Gone);
            };
            let end = ((end_inclusive + 1) as usize).min(content.len());
            content[start as usize..end].to_vec()
        };
        Ok(Box::pin(futures::stream::once(async move {
            Ok(Bytes::from(data))
        })))
    }
}
