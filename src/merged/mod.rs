mod view;

pub use view::{LinkResolver, MergedView, NodeMeta, NodeSecurity, ResolvedNode, VolumeInfo};
