use serde::Serialize;

/// Namespace mutation events, delivered synchronously on the mutating
/// thread in the order the mutations occurred. Paths are canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NamespaceEvent {
    FileAdded { path: String },
    FileDeleted { path: String },
    FileMoved { old: String, new: String },
    FolderAdded { path: String },
    FolderDeleted { path: String },
    FolderMoved { old: String, new: String },
}

impl NamespaceEvent {
    /// The path a subscriber should invalidate (the old path for moves).
    pub fn primary_path(&self) -> &str {
        match self {
            NamespaceEvent::FileAdded { path }
            | NamespaceEvent::FileDeleted { path }
            | NamespaceEvent::FolderAdded { path }
            | NamespaceEvent::FolderDeleted { path } => path,
            NamespaceEvent::FileMoved { old, .. } | NamespaceEvent::FolderMoved { old, .. } => old,
        }
    }

    pub fn is_folder_event(&self) -> bool {
        matches!(
            self,
            NamespaceEvent::FolderAdded { .. }
                | NamespaceEvent::FolderDeleted { .. }
                | NamespaceEvent::FolderMoved { .. }
        )
    }
}

pub type Subscriber = Box<dyn Fn(&NamespaceEvent) + Send + Sync>;
