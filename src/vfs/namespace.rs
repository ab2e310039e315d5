use std::sync::Mutex;
use tracing::trace;

use super::events::{NamespaceEvent, Subscriber};
use super::node::{Arena, FileNode, FolderNode, ROOT};
use super::path;
use crate::error::{VfsError, VfsResult};
use crate::util::lock_unpoisoned;
use crate::vfs::FileRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
}

/// Result of a path lookup. Paths are returned in stored (canonical,
/// case-preserved) form.
#[derive(Debug, Clone)]
pub enum FoundNode {
    Folder { path: String },
    File { path: String, file: FileRef },
}

struct Inner {
    arena: Arena,
    subscribers: Vec<Subscriber>,
}

/// In-memory tree of the remote hierarchy. One coarse lock serialises
/// mutations and reads; events fire synchronously under it, in
/// mutation order. Subscribers must not call back into the namespace.
pub struct VirtualNamespace {
    inner: Mutex<Inner>,
}

impl Default for VirtualNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualNamespace {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                arena: Arena::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn subscribe(&self, subscriber: impl Fn(&NamespaceEvent) + Send + Sync + 'static) {
        lock_unpoisoned(&self.inner)
            .subscribers
            .push(Box::new(subscriber));
    }

    pub fn find(&self, raw_path: &str) -> Option<FoundNode> {
        let path = path::canonicalize(raw_path);
        let inner = lock_unpoisoned(&self.inner);
        if path == "/" {
            return Some(FoundNode::Folder {
                path: "/".to_string(),
            });
        }

        let segments: Vec<&str> = path::segments(&path).collect();
        let (leaf, folders) = segments.split_last()?;
        let mut current = ROOT;
        for segment in folders {
            current = inner.find_child_folder(current, segment)?;
        }
        if let Some(idx) = inner.find_child_folder(current, leaf) {
            return Some(FoundNode::Folder {
                path: inner.arena.full_path(idx),
            });
        }
        let node = inner.find_file(current, leaf)?;
        Some(FoundNode::File {
            path: path::join(&inner.arena.full_path(current), &node.name),
            file: node.file.clone(),
        })
    }

    pub fn file_exists(&self, path: &str) -> bool {
        matches!(self.find(path), Some(FoundNode::File { .. }))
    }

    pub fn folder_exists(&self, path: &str) -> bool {
        matches!(self.find(path), Some(FoundNode::Folder { .. }))
    }

    /// Entries of a folder in insertion order; `None` if the path is
    /// not a folder.
    pub fn list(&self, raw_path: &str) -> Option<Vec<DirEntry>> {
        let path = path::canonicalize(raw_path);
        let inner = lock_unpoisoned(&self.inner);
        let idx = inner.walk(&path)?;
        let folder = inner.arena.folder(idx);
        let mut entries = Vec::with_capacity(folder.folders.len() + folder.files.len());
        for child in &folder.folders {
            entries.push(DirEntry {
                name: inner.arena.folder(*child).name.clone(),
                kind: NodeKind::Folder,
                size: 0,
            });
        }
        for file in &folder.files {
            entries.push(DirEntry {
                name: file.name.clone(),
                kind: NodeKind::File,
                size: file.file.size,
            });
        }
        Some(entries)
    }

    /// Insert a file, creating intermediate folders as needed. Every
    /// segment is sanitised; the leaf gets a ` (n)` suffix on
    /// collision. Returns the canonical path actually used.
    pub fn add_file(&self, raw_path: &str, file: FileRef) -> VfsResult<String> {
        let path = path::canonicalize(raw_path);
        let segments: Vec<&str> = path::segments(&path).collect();
        let Some((leaf_raw, folders)) = segments.split_last() else {
            return Err(VfsError::NotFound("empty file path".to_string()));
        };

        let mut inner = lock_unpoisoned(&self.inner);
        let mut events = Vec::new();
        let parent = inner.ensure_folders(folders, &mut events);

        let leaf = inner.unique_name(parent, &path::sanitize_name(leaf_raw));
        let full = path::join(&inner.arena.full_path(parent), &leaf);
        inner.arena.folder_mut(parent).files.push(FileNode {
            name: leaf,
            file,
        });
        events.push(NamespaceEvent::FileAdded { path: full.clone() });

        inner.dispatch(events);
        trace!("Added virtual file {}", full);
        Ok(full)
    }

    /// Re-insert a file at its persisted path, without sanitisation or
    /// collision suffixing (the path was canonical when first created).
    pub fn restore_file(&self, raw_path: &str, file: FileRef) -> VfsResult<String> {
        let path = path::canonicalize(raw_path);
        let segments: Vec<&str> = path::segments(&path).collect();
        let Some((leaf, folders)) = segments.split_last() else {
            return Err(VfsError::NotFound("empty file path".to_string()));
        };

        let mut inner = lock_unpoisoned(&self.inner);
        let mut events = Vec::new();
        let parent = inner.ensure_folders_exact(folders, &mut events);
        if inner.name_taken(parent, leaf) {
            inner.dispatch(events);
            return Err(VfsError::NameCollision(path));
        }
        let full = path::join(&inner.arena.full_path(parent), leaf);
        inner.arena.folder_mut(parent).files.push(FileNode {
            name: leaf.to_string(),
            file,
        });
        events.push(NamespaceEvent::FileAdded { path: full.clone() });
        inner.dispatch(events);
        Ok(full)
    }

    /// Remove a file node. Returns the reference it held.
    pub fn delete_file(&self, raw_path: &str) -> VfsResult<FileRef> {
        let path = path::canonicalize(raw_path);
        let Some(parent_path) = path::parent(&path) else {
            return Err(VfsError::NotFound(path.clone()));
        };
        let leaf = path::leaf(&path);

        let mut inner = lock_unpoisoned(&self.inner);
        let Some(parent) = inner.walk(parent_path) else {
            return Err(VfsError::NotFound(path.clone()));
        };
        let folder = inner.arena.folder_mut(parent);
        let Some(pos) = folder
            .files
            .iter()
            .position(|f| path::eq_ci(&f.name, leaf))
        else {
            return Err(VfsError::NotFound(path.clone()));
        };
        let removed = folder.files.remove(pos);
        let full = path::join(&inner.arena.full_path(parent), &removed.name);
        inner.dispatch(vec![NamespaceEvent::FileDeleted { path: full }]);
        Ok(removed.file)
    }

    /// Remove a folder subtree. Emits `file_deleted` for every
    /// descendant file (depth-first) and `folder_deleted` bottom-up,
    /// so subscribers can mark each file deleted.
    pub fn delete_folder(&self, raw_path: &str) -> VfsResult<()> {
        let path = path::canonicalize(raw_path);
        if path == "/" {
            return Err(VfsError::ReadOnly("/".to_string()));
        }

        let mut inner = lock_unpoisoned(&self.inner);
        let Some(idx) = inner.walk(&path) else {
            return Err(VfsError::NotFound(path.clone()));
        };
        let parent = inner
            .arena
            .folder(idx)
            .parent
            .expect("non-root folder has a parent");

        let mut events = Vec::new();
        inner.collect_subtree_deletion(idx, &mut events);
        inner.arena.folder_mut(parent).folders.retain(|f| *f != idx);
        inner.release_subtree(idx);
        inner.dispatch(events);
        Ok(())
    }

    /// Rename and/or reparent a file. `dst` is the full target path.
    /// Returns the canonical path actually used.
    pub fn move_file(&self, raw_src: &str, raw_dst: &str) -> VfsResult<String> {
        let src = path::canonicalize(raw_src);
        let dst = path::canonicalize(raw_dst);
        let dst_segments: Vec<&str> = path::segments(&dst).collect();
        let Some((dst_leaf_raw, dst_folders)) = dst_segments.split_last() else {
            return Err(VfsError::NotFound("empty target path".to_string()));
        };

        let mut inner = lock_unpoisoned(&self.inner);

        let Some(src_parent_path) = path::parent(&src) else {
            return Err(VfsError::NotFound(src.clone()));
        };
        let src_leaf = path::leaf(&src);
        let Some(src_parent) = inner.walk(src_parent_path) else {
            return Err(VfsError::NotFound(src.clone()));
        };
        let Some(src_pos) = inner
            .arena
            .folder(src_parent)
            .files
            .iter()
            .position(|f| path::eq_ci(&f.name, src_leaf))
        else {
            return Err(VfsError::NotFound(src.clone()));
        };

        let mut events = Vec::new();
        let dst_parent = inner.ensure_folders(dst_folders, &mut events);
        let dst_leaf = path::sanitize_name(dst_leaf_raw);

        // A same-folder case-change rename collides only with other
        // entries.
        let self_rename = dst_parent == src_parent
            && path::eq_ci(
                &inner.arena.folder(src_parent).files[src_pos].name,
                &dst_leaf,
            );
        if !self_rename && inner.name_taken(dst_parent, &dst_leaf) {
            inner.dispatch(events);
            return Err(VfsError::NameCollision(dst));
        }

        let mut node = inner.arena.folder_mut(src_parent).files.remove(src_pos);
        let old = path::join(&inner.arena.full_path(src_parent), &node.name);
        node.name = dst_leaf;
        let new = path::join(&inner.arena.full_path(dst_parent), &node.name);
        inner.arena.folder_mut(dst_parent).files.push(node);

        events.push(NamespaceEvent::FileMoved {
            old,
            new: new.clone(),
        });
        inner.dispatch(events);
        Ok(new)
    }

    /// Rename and/or reparent a folder subtree. Every descendant
    /// file's path changes implicitly; subscribers rewrite stored
    /// paths from the emitted `folder_moved` prefix pair.
    pub fn move_folder(&self, raw_src: &str, raw_dst: &str) -> VfsResult<String> {
        let src = path::canonicalize(raw_src);
        let dst = path::canonicalize(raw_dst);
        if src == "/" {
            return Err(VfsError::ReadOnly("/".to_string()));
        }
        let dst_segments: Vec<&str> = path::segments(&dst).collect();
        let Some((dst_leaf_raw, dst_folders)) = dst_segments.split_last() else {
            return Err(VfsError::NotFound("empty target path".to_string()));
        };

        let mut inner = lock_unpoisoned(&self.inner);
        let Some(idx) = inner.walk(&src) else {
            return Err(VfsError::NotFound(src.clone()));
        };

        let mut events = Vec::new();
        let dst_parent = inner.ensure_folders(dst_folders, &mut events);
        if inner.arena.is_in_subtree(idx, dst_parent) {
            inner.dispatch(events);
            return Err(VfsError::NameCollision(format!(
                "cannot move {} into its own subtree",
                src
            )));
        }

        let src_parent = inner
            .arena
            .folder(idx)
            .parent
            .expect("non-root folder has a parent");
        let dst_leaf = path::sanitize_name(dst_leaf_raw);
        let self_rename =
            dst_parent == src_parent && path::eq_ci(&inner.arena.folder(idx).name, &dst_leaf);
        if !self_rename && inner.name_taken(dst_parent, &dst_leaf) {
            inner.dispatch(events);
            return Err(VfsError::NameCollision(dst));
        }

        let old = inner.arena.full_path(idx);
        inner
            .arena
            .folder_mut(src_parent)
            .folders
            .retain(|f| *f != idx);
        {
            let folder = inner.arena.folder_mut(idx);
            folder.name = dst_leaf;
            folder.parent = Some(dst_parent);
        }
        inner.arena.folder_mut(dst_parent).folders.push(idx);
        let new = inner.arena.full_path(idx);

        events.push(NamespaceEvent::FolderMoved {
            old,
            new: new.clone(),
        });
        inner.dispatch(events);
        Ok(new)
    }
}

impl Inner {
    fn dispatch(&self, events: Vec<NamespaceEvent>) {
        for event in &events {
            for subscriber in &self.subscribers {
                subscriber(event);
            }
        }
    }

    fn walk(&self, path: &str) -> Option<usize> {
        let mut current = ROOT;
        for segment in path::segments(path) {
            current = self.find_child_folder(current, segment)?;
        }
        Some(current)
    }

    fn find_child_folder(&self, folder: usize, name: &str) -> Option<usize> {
        self.arena
            .folder(folder)
            .folders
            .iter()
            .copied()
            .find(|idx| path::eq_ci(&self.arena.folder(*idx).name, name))
    }

    fn find_file<'a>(&'a self, folder: usize, name: &str) -> Option<&'a FileNode> {
        self.arena
            .folder(folder)
            .files
            .iter()
            .find(|f| path::eq_ci(&f.name, name))
    }

    fn name_taken(&self, folder: usize, name: &str) -> bool {
        self.find_child_folder(folder, name).is_some() || self.find_file(folder, name).is_some()
    }

    /// First free variant of `desired` within `folder`:
    /// `name`, `name (1)`, `name (2)`, ...
    fn unique_name(&self, folder: usize, desired: &str) -> String {
        if !self.name_taken(folder, desired) {
            return desired.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = path::numbered_name(desired, n);
            if !self.name_taken(folder, &candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Walk or create the folder chain, sanitising each segment and
    /// suffixing on collision with an existing file.
    fn ensure_folders(&mut self, segments: &[&str], events: &mut Vec<NamespaceEvent>) -> usize {
        let mut current = ROOT;
        for segment in segments {
            let name = path::sanitize_name(segment);
            if let Some(existing) = self.find_child_folder(current, &name) {
                current = existing;
                continue;
            }
            let name = self.unique_name(current, &name);
            current = self.create_folder(current, name, events);
        }
        current
    }

    /// Like `ensure_folders` but with the segments taken verbatim
    /// (used when restoring persisted paths).
    fn ensure_folders_exact(&mut self, segments: &[&str], events: &mut Vec<NamespaceEvent>) -> usize {
        let mut current = ROOT;
        for segment in segments {
            match self.find_child_folder(current, segment) {
                Some(existing) => current = existing,
                None => current = self.create_folder(current, segment.to_string(), events),
            }
        }
        current
    }

    fn create_folder(
        &mut self,
        parent: usize,
        name: String,
        events: &mut Vec<NamespaceEvent>,
    ) -> usize {
        let idx = self.arena.alloc(FolderNode {
            name,
            parent: Some(parent),
            folders: Vec::new(),
            files: Vec::new(),
        });
        self.arena.folder_mut(parent).folders.push(idx);
        events.push(NamespaceEvent::FolderAdded {
            path: self.arena.full_path(idx),
        });
        idx
    }

    fn collect_subtree_deletion(&self, idx: usize, events: &mut Vec<NamespaceEvent>) {
        let folder_path = self.arena.full_path(idx);
        let folder = self.arena.folder(idx);
        for file in &folder.files {
            events.push(NamespaceEvent::FileDeleted {
                path: path::join(&folder_path, &file.name),
            });
        }
        for child in &folder.folders {
            self.collect_subtree_deletion(*child, events);
        }
        events.push(NamespaceEvent::FolderDeleted { path: folder_path });
    }

    fn release_subtree(&mut self, idx: usize) {
        let children = self.arena.folder(idx).folders.clone();
        for child in children {
            self.release_subtree(child);
        }
        self.arena.release(idx);
    }
}
