//! debrid-vfs: bridges a remote debrid-style download service with
//! media-library automation by exposing the provider's completed
//! downloads as a merged, locally-overlaid virtual filesystem backed
//! by a chunked read-through block cache.
//!
//! The kernel/userspace mount driver and the torrent-client-compatible
//! HTTP API are collaborators: the [`engine::Engine`] assembles the
//! core they attach to (the [`vfs::VirtualNamespace`], the
//! [`merged::MergedView`] overlay and the [`cache::ChunkCache`]) and
//! runs the background reconciliation loops against an abstract
//! [`provider::RemoteProvider`].

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod merged;
pub mod models;
pub mod provider;
pub mod registry;
pub mod store;
pub mod vfs;
pub mod workers;

mod util;

pub use cache::{CacheStatsSnapshot, CachedFile, ChunkCache, ChunkStore};
pub use config::Config;
pub use engine::Engine;
pub use error::{VfsError, VfsResult};
pub use merged::{LinkResolver, MergedView};
pub use models::{Container, ContainerHash, FileEntry, FileId, FileKey, HostId};
pub use provider::{ProviderError, RemoteProvider};
pub use vfs::VirtualNamespace;
