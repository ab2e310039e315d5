use std::io;

use thiserror::Error;

/// Error taxonomy shared by the cache, the namespace and the merged view.
///
/// Background loops do not use this type; they log and continue with
/// `anyhow` the way the rest of the crate's workers do.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Offset negative-equivalent (past EOF) or length invalid for the file.
    #[error("invalid range: offset {offset} length {length} for file of {size} bytes")]
    InvalidRange { offset: u64, length: u64, size: u64 },

    /// All retries exhausted or a non-retryable upstream response.
    /// The caller decides whether to refresh the download URL and retry.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// Cooperative cancellation. Partial on-disk state has been cleaned up.
    #[error("operation cancelled")]
    Cancelled,

    /// The path (or chunk) does not resolve to anything.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path resolves to a directory where a file was required.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// Write attempted against a purely virtual path.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// Create or rename target already resolves.
    #[error("name collision: {0}")]
    NameCollision(String),

    /// Delete of a folder whose merged listing still has entries.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// I/O failure that leaves accounting uncertain; the cache recovers
    /// by invalidating the owning file.
    #[error("fatal I/O error: {0}")]
    Fatal(#[from] io::Error),
}

impl VfsError {
    /// Whether a caller holding a refreshable download URL should
    /// re-resolve the link and retry the operation once.
    pub fn is_refreshable(&self) -> bool {
        matches!(self, VfsError::FetchFailed(_))
    }
}

pub type VfsResult<T> = Result<T, VfsError>;
