mod descriptor;
mod persist;
mod watcher;

pub use descriptor::{DESCRIPTOR_EXT, StoreCategory, descriptor_file_name, from_json, to_json};
pub use persist::PersistedStore;
pub use watcher::DescriptorWatcher;
