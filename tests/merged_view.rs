mod common;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{FakeProvider, pattern};
use debrid_vfs::cache::{CachedFile, ChunkCache, ChunkStore};
use debrid_vfs::config::CacheConfig;
use debrid_vfs::error::VfsError;
use debrid_vfs::merged::{LinkResolver, MergedView};
use debrid_vfs::models::FileKey;
use debrid_vfs::vfs::{FileRef, NodeKind, VirtualNamespace};

/// Resolver backed by a fixed key -> descriptor table.
#[derive(Default)]
struct TableResolver {
    table: Mutex<HashMap<FileKey, CachedFile>>,
}

impl TableResolver {
    fn insert(&self, descriptor: CachedFile) {
        self.table
            .lock()
            .unwrap()
            .insert(descriptor.key.clone(), descriptor);
    }
}

#[async_trait]
impl LinkResolver for TableResolver {
    async fn resolve(&self, key: &FileKey) -> Result<CachedFile, VfsError> {
        self.table
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(key.to_string()))
    }

    async fn refresh(&self, key: &FileKey) -> Result<CachedFile, VfsError> {
        self.resolve(key).await
    }
}

struct Fixture {
    provider: Arc<FakeProvider>,
    namespace: Arc<VirtualNamespace>,
    resolver: Arc<TableResolver>,
    view: Arc<MergedView>,
    local_root: TempDir,
    _cache_root: TempDir,
}

fn fixture() -> Fixture {
    common::init_tracing();
    let provider = FakeProvider::new();
    let cache_root = TempDir::new().unwrap();
    let local_root = TempDir::new().unwrap();
    let namespace = Arc::new(VirtualNamespace::new());
    let store = Arc::new(ChunkStore::new(cache_root.path().to_path_buf()));
    let config = CacheConfig {
        chunk_size: 64,
        max_cache_size: 1 << 20,
        readahead_trigger_position: 0,
        max_total_concurrent_downloads: 4,
        max_retries: 2,
        retry_base_delay_ms: 10,
    };
    let cache = Arc::new(ChunkCache::new(provider.clone(), store, &config));
    let resolver = Arc::new(TableResolver::default());
    let view = MergedView::new(
        namespace.clone(),
        cache,
        resolver.clone(),
        local_root.path().to_path_buf(),
    );
    Fixture {
        provider,
        namespace,
        resolver,
        view,
        local_root,
        _cache_root: cache_root,
    }
}

impl Fixture {
    /// Add a virtual file with the given content, wiring provider and
    /// resolver.
    fn add_virtual(&self, path: &str, file_id: u32, content: Vec<u8>) -> String {
        let key = FileKey::new("feedface", file_id);
        let url = format!("fetch://virtual/{}", file_id);
        self.provider.seed_url(&url, content.clone());
        let actual = self
            .namespace
            .add_file(
                path,
                FileRef {
                    key: key.clone(),
                    size: content.len() as u64,
                },
            )
            .unwrap();
        self.resolver.insert(CachedFile {
            key,
            size: content.len() as u64,
            url,
        });
        actual
    }
}

#[tokio::test]
async fn test_local_entries_shadow_virtual_in_merged_listing() {
    let fx = fixture();
    // Virtual side: /a.txt and /shared/b.txt.
    fx.add_virtual("/a.txt", 0, b"virtual a".to_vec());
    fx.add_virtual("/shared/b.txt", 1, pattern(100));
    // Local side: a.txt (different content) and an empty shared/.
    std::fs::write(fx.local_root.path().join("a.txt"), b"local a").unwrap();
    std::fs::create_dir(fx.local_root.path().join("shared")).unwrap();

    let entries = fx.view.list("/").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "shared"]);

    // The local a.txt wins and reports its own size.
    let a = entries.iter().find(|e| e.name == "a.txt").unwrap();
    assert_eq!(a.kind, NodeKind::File);
    assert_eq!(a.size, b"local a".len() as u64);

    let token = CancellationToken::new();
    let data = fx.view.read("/a.txt", 0, 100, &token).await.unwrap();
    assert_eq!(&data[..], b"local a");

    // The virtual file under shared/ is still reachable through the
    // merged folder and is served by the chunk cache.
    let data = fx.view.read("/shared/b.txt", 0, 100, &token).await.unwrap();
    assert_eq!(&data[..], &pattern(100)[..]);
}

#[tokio::test]
async fn test_virtual_read_spans_chunks() {
    let fx = fixture();
    let content = pattern(200);
    fx.add_virtual("/movie/part.mkv", 0, content.clone());

    let token = CancellationToken::new();
    let data = fx
        .view
        .read("/movie/part.mkv", 10, 150, &token)
        .await
        .unwrap();
    assert_eq!(&data[..], &content[10..160]);
}

#[tokio::test]
async fn test_writes_route_local_only() {
    let fx = fixture();
    fx.add_virtual("/v/file.bin", 0, pattern(10));
    std::fs::create_dir(fx.local_root.path().join("l")).unwrap();
    std::fs::write(fx.local_root.path().join("l/file.bin"), b"1234").unwrap();

    let err = fx.view.write("/v/file.bin", 0, b"data").await.unwrap_err();
    assert!(matches!(err, VfsError::ReadOnly(_)));

    fx.view.write("/l/file.bin", 2, b"XY").await.unwrap();
    let on_disk = std::fs::read(fx.local_root.path().join("l/file.bin")).unwrap();
    assert_eq!(&on_disk, b"12XY");

    let err = fx.view.write("/nope.bin", 0, b"x").await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)));
}

#[tokio::test]
async fn test_create_file_rejects_existing_names() {
    let fx = fixture();
    fx.add_virtual("/v.bin", 0, pattern(10));

    let err = fx.view.create_file("/v.bin").await.unwrap_err();
    assert!(matches!(err, VfsError::NameCollision(_)));

    let created = fx.view.create_file("/new/one.txt").await.unwrap();
    assert!(created.exists());
    let err = fx.view.create_file("/new/one.txt").await.unwrap_err();
    assert!(matches!(err, VfsError::NameCollision(_)));
}

#[tokio::test]
async fn test_delete_rules() {
    let fx = fixture();
    fx.add_virtual("/d/v.bin", 0, pattern(10));
    std::fs::create_dir(fx.local_root.path().join("d")).unwrap();
    std::fs::write(fx.local_root.path().join("d/l.bin"), b"x").unwrap();

    // Merged /d has entries on both sides.
    let err = fx.view.delete("/d").await.unwrap_err();
    assert!(matches!(err, VfsError::DirectoryNotEmpty(_)));

    fx.view.delete("/d/l.bin").await.unwrap();
    fx.view.delete("/d/v.bin").await.unwrap();
    assert!(!fx.namespace.file_exists("/d/v.bin"));

    // Both sides empty now; the merged folder can go.
    fx.view.delete("/d").await.unwrap();
    let err = fx.view.resolve("/d").await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)));
}

#[tokio::test]
async fn test_rename_virtual_preserves_bytes() {
    let fx = fixture();
    let content = pattern(130);
    fx.add_virtual("/old/name.mkv", 0, content.clone());
    let token = CancellationToken::new();

    let before = fx
        .view
        .read("/old/name.mkv", 0, content.len() as u64, &token)
        .await
        .unwrap();
    fx.view.rename("/old/name.mkv", "/new/other.mkv").await.unwrap();

    assert!(matches!(
        fx.view.resolve("/old/name.mkv").await,
        Err(VfsError::NotFound(_))
    ));
    let after = fx
        .view
        .read("/new/other.mkv", 0, content.len() as u64, &token)
        .await
        .unwrap();
    assert_eq!(&before[..], &after[..]);
    assert_eq!(&after[..], &content[..]);
}

#[tokio::test]
async fn test_rename_collision_rejected() {
    let fx = fixture();
    fx.add_virtual("/a.bin", 0, pattern(10));
    std::fs::write(fx.local_root.path().join("b.bin"), b"local").unwrap();

    let err = fx.view.rename("/a.bin", "/b.bin").await.unwrap_err();
    assert!(matches!(err, VfsError::NameCollision(_)));
}

#[tokio::test]
async fn test_lookup_cache_tracks_namespace_changes() {
    let fx = fixture();
    fx.add_virtual("/cachetest/x.bin", 0, pattern(10));

    // Prime the memoised lookup, then mutate the namespace.
    assert!(fx.view.resolve("/cachetest/x.bin").await.is_ok());
    fx.namespace.delete_file("/cachetest/x.bin").unwrap();
    assert!(matches!(
        fx.view.resolve("/cachetest/x.bin").await,
        Err(VfsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_reported_volume_semantics() {
    let fx = fixture();
    let volume = fx.view.volume_info();
    assert!(!volume.case_sensitive);
    assert!(volume.case_preserving);

    let security = fx.view.security();
    assert!(security.owner_is_system);
    assert!(security.world_read);
    assert!(security.deny_permission_change);
}
