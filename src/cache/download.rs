use bytes::BytesMut;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::chunk_store::ChunkStore;
use super::stats::CacheStats;
use crate::error::{VfsError, VfsResult};
use crate::models::FileKey;
use crate::provider::{ProviderError, RemoteProvider};

/// Everything needed to fetch one chunk: a short-lived descriptor, not
/// a reference into the namespace.
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub key: FileKey,
    pub index: u64,
    pub url: String,
    /// Exact byte length of this chunk (the last chunk is short).
    pub length: u64,
}

enum AttemptError {
    Cancelled,
    Provider(ProviderError),
    /// Upstream did not honour the requested range.
    Protocol(String),
    Io(std::io::Error),
}

/// Fetches single chunks from the provider under the global download
/// semaphore, with linear-backoff retries and cooperative cancellation.
pub struct Downloader {
    provider: Arc<dyn RemoteProvider>,
    store: Arc<ChunkStore>,
    semaphore: Arc<Semaphore>,
    chunk_size: u64,
    max_retries: u32,
    base_delay: Duration,
    stats: Arc<CacheStats>,
}

impl Downloader {
    pub fn new(
        provider: Arc<dyn RemoteProvider>,
        store: Arc<ChunkStore>,
        chunk_size: u64,
        max_concurrent: usize,
        max_retries: u32,
        base_delay: Duration,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            provider,
            store,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            chunk_size,
            max_retries: max_retries.max(1),
            base_delay,
            stats,
        }
    }

    /// Download one chunk and commit it through the store's atomic
    /// protocol. Accounting only changes on the final rename, so
    /// cancellation at any point leaves no trace.
    pub async fn fetch_chunk(&self, spec: &ChunkSpec, token: &CancellationToken) -> VfsResult<()> {
        let _permit = tokio::select! {
            permit = self.semaphore.acquire() => {
                match permit {
                    Ok(permit) => permit,
                    // Semaphore closure only happens at teardown.
                    Err(_) => {
                        self.stats.record_download_cancelled();
                        return Err(VfsError::Cancelled);
                    }
                }
            }
            _ = token.cancelled() => {
                self.stats.record_download_cancelled();
                return Err(VfsError::Cancelled);
            }
        };

        self.stats.record_download_started();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_fetch(spec, token).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(
                            "Downloaded chunk {} of {} after {} attempts",
                            spec.index, spec.key, attempt
                        );
                    }
                    self.stats.record_download_completed();
                    return Ok(());
                }
                Err(AttemptError::Cancelled) => {
                    self.stats.record_download_cancelled();
                    return Err(VfsError::Cancelled);
                }
                Err(AttemptError::Io(e)) => {
                    self.stats.record_download_failed();
                    return Err(VfsError::Fatal(e));
                }
                Err(AttemptError::Protocol(reason)) => {
                    self.stats.record_download_failed();
                    return Err(VfsError::FetchFailed(reason));
                }
                Err(AttemptError::Provider(e)) => {
                    if !e.is_retryable() || attempt >= self.max_retries {
                        warn!(
                            "Chunk {} of {} failed after {} attempts: {}",
                            spec.index, spec.key, attempt, e
                        );
                        self.stats.record_download_failed();
                        return Err(VfsError::FetchFailed(e.to_string()));
                    }
                    let delay = self.base_delay * attempt;
                    warn!(
                        "Attempt {} for chunk {} of {} failed: {}. Retrying in {:?}",
                        attempt, spec.index, spec.key, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            self.stats.record_download_cancelled();
                            return Err(VfsError::Cancelled);
                        }
                    }
                }
            }
        }
    }

    async fn try_fetch(&self, spec: &ChunkSpec, token: &CancellationToken) -> Result<(), AttemptError> {
        let start = spec.index * self.chunk_size;
        let end = start + spec.length - 1;

        let mut stream = tokio::select! {
            result = self.provider.fetch_range(&spec.url, start, end) => {
                result.map_err(AttemptError::Provider)?
            }
            _ = token.cancelled() => return Err(AttemptError::Cancelled),
        };

        let mut buf = BytesMut::with_capacity(spec.length as usize);
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = token.cancelled() => return Err(AttemptError::Cancelled),
            };
            match next {
                Some(Ok(bytes)) => {
                    if buf.len() + bytes.len() > spec.length as usize {
                        return Err(AttemptError::Protocol(format!(
                            "range not honoured for chunk {} of {}: got more than {} bytes",
                            spec.index, spec.key, spec.length
                        )));
                    }
                    buf.extend_from_slice(&bytes);
                }
                // A body that ends early is a transient transport fault.
                Some(Err(e)) => return Err(AttemptError::Provider(e)),
                None => break,
            }
        }
        if buf.len() as u64 != spec.length {
            return Err(AttemptError::Provider(ProviderError::Network(format!(
                "short body: {} of {} bytes",
                buf.len(),
                spec.length
            ))));
        }

        self.store
            .write_atomic(&spec.key, spec.index, &buf)
            .await
            .map_err(|e| match e {
                VfsError::Fatal(io) => AttemptError::Io(io),
                other => AttemptError::Protocol(other.to_string()),
            })
    }
}
