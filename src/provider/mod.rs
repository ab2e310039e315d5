pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

use crate::models::{ContainerHash, FileId, HostId};

/// Errors surfaced by a [`RemoteProvider`] implementation.
///
/// 401/403 propagate to the caller unchanged; 429 is retryable.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited")]
    RateLimited,

    /// The resource behind a fetchable URL no longer exists (stale
    /// download URL). The caller is expected to unrestrict again.
    #[error("resource gone")]
    Gone,

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited | ProviderError::Timeout | ProviderError::Network(_) => true,
            ProviderError::Status(code) => *code == 408 || *code >= 500,
            _ => false,
        }
    }

    /// Maps an HTTP status to the provider taxonomy; `None` for success.
    pub fn from_status(code: u16) -> Option<Self> {
        match code {
            200..=299 => None,
            401 | 403 => Some(ProviderError::Unauthorized),
            404 | 410 => Some(ProviderError::Gone),
            429 => Some(ProviderError::RateLimited),
            other => Some(ProviderError::Status(other)),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16())
                .unwrap_or_else(|| ProviderError::Network(err.to_string()))
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// A container as the upstream provider reports it.
#[derive(Debug, Clone)]
pub struct RemoteContainer {
    pub host_id: HostId,
    pub hash: ContainerHash,
    pub name: String,
    /// Raw upstream status string; mapped via
    /// [`RemoteStatus::from_upstream`](crate::models::RemoteStatus::from_upstream).
    pub status: String,
    pub size: u64,
    pub bytes_done: u64,
    pub speed_bps: u64,
    pub seeders: u32,
    pub added_at: Option<DateTime<Utc>>,
    pub files: Vec<RemoteFile>,
    /// Restricted link identifiers, parallel to the selected files.
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub id: FileId,
    /// Path of the file inside the container, `/`-separated.
    pub path: String,
    pub size: u64,
    pub selected: bool,
}

#[derive(Debug, Clone)]
pub struct AddedContainer {
    pub host_id: HostId,
}

#[derive(Debug, Clone)]
pub struct LinkCheck {
    pub supported: bool,
}

/// Result of resolving a restricted link to a fetchable URL.
#[derive(Debug, Clone)]
pub struct UnrestrictedLink {
    pub host_id: HostId,
    pub filename: String,
    pub size: u64,
    pub link: String,
    pub download_url: String,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Abstract upstream debrid service. The wire protocol is the
/// implementation's concern; the core only relies on this contract.
#[async_trait]
pub trait RemoteProvider: Send + Sync + fmt::Debug {
    /// List containers, paginated. `filter` is provider-defined.
    async fn list(
        &self,
        page: u32,
        limit: u32,
        filter: Option<&str>,
    ) -> Result<Vec<RemoteContainer>, ProviderError>;

    /// Full info for one container, including files and links.
    async fn info(&self, host_id: &HostId) -> Result<RemoteContainer, ProviderError>;

    async fn add_torrent(
        &self,
        bytes: &[u8],
        host: &str,
        category: Option<&str>,
        tags: Option<&str>,
    ) -> Result<AddedContainer, ProviderError>;

    async fn add_magnet(&self, uri: &str, host: &str) -> Result<AddedContainer, ProviderError>;

    /// `selector` is the provider's file-selection expression
    /// (`"all"` or a comma-separated id list).
    async fn select_files(&self, host_id: &HostId, selector: &str) -> Result<(), ProviderError>;

    async fn delete(&self, host_id: &HostId) -> Result<(), ProviderError>;

    async fn check_link(&self, url: &str) -> Result<LinkCheck, ProviderError>;

    async fn unrestrict(&self, url: &str) -> Result<UnrestrictedLink, ProviderError>;

    /// HTTP range GET of `[start, end_inclusive]` against a fetchable URL.
    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<ByteStream, ProviderError>;
}
