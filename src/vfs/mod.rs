mod events;
mod namespace;
mod node;
pub mod path;

pub use events::NamespaceEvent;
pub use namespace::{DirEntry, FoundNode, NodeKind, VirtualNamespace};
pub use node::FileRef;
