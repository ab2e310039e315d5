mod container;
mod identifiers;

pub use container::{
    Container, FileEntry, LifecycleState, MediaInfo, RemoteStatus, TransferSample,
};
pub use identifiers::{ContainerHash, FileId, FileKey, HostId};
